//! Shared types for the Attractor pipeline engine.
//!
//! This crate is the bottom of the `attractor-*` stack: the error taxonomy
//! (`EngineError`), the value every handler returns (`Outcome`), and the
//! process-local mutable store handlers and middlewares share
//! (`PipelineContext`). Nothing in here knows about DOT syntax, graphs, or
//! handlers — those live in `attractor-dot` and `attractor-pipeline`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Convenience alias used throughout the `attractor-*` crates.
pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Root of the engine's error taxonomy. Every fatal failure mode the runner
/// can raise is a variant here; a handler that merely *reports* failure
/// should return a `failure` [`Outcome`] instead — see the crate-level docs
/// on `attractor-pipeline` for the propagation policy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to parse graph: {0}")]
    Parse(String),

    #[error("graph validation failed: {0}")]
    Validation(String),

    #[error("no handler registered for shape '{shape}' (node '{node_id}')")]
    UnknownShape { shape: String, node_id: String },

    #[error("node '{node_id}' has no outgoing edges")]
    NoEdge {
        node_id: String,
        available_edges: Vec<String>,
    },

    #[error(
        "checkpoint at {path} has schema_version '{found}', engine expects '{expected}'"
    )]
    CheckpointVersion {
        found: String,
        expected: String,
        path: String,
    },

    #[error(
        "checkpoint at {path} references nodes absent from the current graph: {missing_nodes:?}"
    )]
    CheckpointGraphMismatch {
        missing_nodes: Vec<String>,
        path: String,
    },

    #[error("handler failed on node '{node_id}': {message}")]
    Handler {
        node_id: String,
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("node '{node_id}' exceeded max visits ({visit_count} > {max_visits})")]
    LoopDetected {
        node_id: String,
        visit_count: u32,
        max_visits: u32,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable machine-readable tag for this variant, used as an event's
    /// `error_type` field so downstream consumers don't have to parse
    /// `Display` output.
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::Parse(_) => "PARSE",
            EngineError::Validation(_) => "VALIDATION",
            EngineError::UnknownShape { .. } => "UNKNOWN_SHAPE",
            EngineError::NoEdge { .. } => "NO_EDGE",
            EngineError::CheckpointVersion { .. } => "CHECKPOINT_VERSION",
            EngineError::CheckpointGraphMismatch { .. } => "CHECKPOINT_GRAPH_MISMATCH",
            EngineError::Handler { .. } => "HANDLER",
            EngineError::LoopDetected { .. } => "LOOP_DETECTED",
            EngineError::Io(_) => "IO",
            EngineError::Json(_) => "JSON",
        }
    }

    /// `true` for the taxonomy's "fatal, no automatic retry" family (parse,
    /// validation, unknown-shape, no-edge, checkpoint errors) per the
    /// engine's error handling design: the user must act, the runner must
    /// not loop on these.
    pub fn is_fatal_unresumable(&self) -> bool {
        matches!(
            self,
            EngineError::Parse(_)
                | EngineError::Validation(_)
                | EngineError::UnknownShape { .. }
                | EngineError::NoEdge { .. }
                | EngineError::CheckpointVersion { .. }
                | EngineError::CheckpointGraphMismatch { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// OutcomeStatus / Outcome
// ---------------------------------------------------------------------------

/// The five statuses a handler's [`Outcome`] may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
    PartialSuccess,
    Waiting,
    Skipped,
}

impl OutcomeStatus {
    /// The lowercase wire form compared against in `outcome = <status>`
    /// conditions and written into `$last_status`.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Failure => "failure",
            OutcomeStatus::PartialSuccess => "partial_success",
            OutcomeStatus::Waiting => "waiting",
            OutcomeStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// The immutable value every handler returns. Carries enough to drive edge
/// selection (`preferred_label`, `suggested_next`), context merging
/// (`context_updates`), observability (`metadata`), and the token-counting
/// middleware (`raw_messages`, consumed but never checkpointed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub context_updates: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub preferred_label: Option<String>,
    #[serde(default)]
    pub suggested_next: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Opaque list consumed by the token-count middleware. Never persisted
    /// to a checkpoint's `NodeRecord`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_messages: Vec<serde_json::Value>,
}

impl Outcome {
    fn bare(status: OutcomeStatus) -> Self {
        Self {
            status,
            context_updates: HashMap::new(),
            preferred_label: None,
            suggested_next: None,
            metadata: HashMap::new(),
            raw_messages: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::bare(OutcomeStatus::Success)
    }

    pub fn failure() -> Self {
        Self::bare(OutcomeStatus::Failure)
    }

    pub fn partial_success() -> Self {
        Self::bare(OutcomeStatus::PartialSuccess)
    }

    pub fn waiting() -> Self {
        Self::bare(OutcomeStatus::Waiting)
    }

    pub fn skipped() -> Self {
        Self::bare(OutcomeStatus::Skipped)
    }

    pub fn with_context_updates(
        mut self,
        updates: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Self {
        self.context_updates.extend(updates);
        self
    }

    pub fn with_preferred_label(mut self, label: impl Into<String>) -> Self {
        self.preferred_label = Some(label.into());
        self
    }

    pub fn with_suggested_next(mut self, node_id: impl Into<String>) -> Self {
        self.suggested_next = Some(node_id.into());
        self
    }

    pub fn with_metadata(
        mut self,
        metadata: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_raw_messages(mut self, messages: Vec<serde_json::Value>) -> Self {
        self.raw_messages = messages;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn is_failure(&self) -> bool {
        self.status == OutcomeStatus::Failure
    }
}

// ---------------------------------------------------------------------------
// PipelineContext
// ---------------------------------------------------------------------------

/// Engine-reserved context key prefixes/names. Keys under the `$` sigil are
/// owned by the engine; handlers may read them but should not invent new
/// `$`-prefixed keys of their own.
pub const KEY_PIPELINE_ID: &str = "$pipeline_id";
pub const KEY_COMPLETED_NODES: &str = "$completed_nodes";
pub const KEY_LAST_STATUS: &str = "$last_status";
pub const KEY_RETRY_COUNT: &str = "$retry_count";
pub const KEY_PIPELINE_DURATION_S: &str = "$pipeline_duration_s";
pub const KEY_TOTAL_TOKENS: &str = "$total_tokens";

/// Builds the `$node_visits.<id>` key for a given node.
pub fn node_visits_key(node_id: &str) -> String {
    format!("$node_visits.{node_id}")
}

/// Process-local mutable key/value store shared by the runner, middlewares,
/// and sequential handlers. All accesses are serialized under a mutex; the
/// critical section never spans an `.await` outside of acquiring the lock
/// itself, so suspension points (signal polling, subprocess waits) never
/// hold it.
///
/// Cloning a `PipelineContext` yields another handle to the *same* backing
/// store — use [`snapshot`](Self::snapshot) plus [`from_map`](Self::from_map)
/// to get an independent copy for a parallel branch.
#[derive(Clone)]
pub struct PipelineContext {
    inner: Arc<tokio::sync::Mutex<HashMap<String, serde_json::Value>>>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Build a context pre-seeded with `values` (used to hydrate a resumed
    /// run's persisted context, and to give a parallel branch its own
    /// snapshot copy).
    pub fn from_map(values: HashMap<String, serde_json::Value>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(values)),
        }
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().await.insert(key.into(), value);
    }

    /// Merge `updates` into the store; existing keys not present in
    /// `updates` are preserved.
    pub async fn update(&self, updates: HashMap<String, serde_json::Value>) {
        self.inner.lock().await.extend(updates);
    }

    /// Shallow copy of the current values.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.lock().await.clone()
    }

    /// A fully independent context seeded from this one's current snapshot.
    /// Used to give each parallel branch its own copy so siblings cannot see
    /// or clobber each other's keys.
    pub async fn snapshot_isolated(&self) -> PipelineContext {
        PipelineContext::from_map(self.snapshot().await)
    }

    /// Increment and return the new visit count for `node_id`, stored under
    /// `$node_visits.<node_id>`.
    pub async fn increment_visit(&self, node_id: &str) -> u32 {
        let key = node_visits_key(node_id);
        let mut guard = self.inner.lock().await;
        let count = guard
            .get(&key)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            .saturating_add(1) as u32;
        guard.insert(key, serde_json::json!(count));
        count
    }

    pub async fn visit_count(&self, node_id: &str) -> u32 {
        self.get(&node_visits_key(node_id))
            .await
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}
