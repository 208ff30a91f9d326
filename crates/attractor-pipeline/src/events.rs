//! Structured lifecycle event bus: the 14 canonical event types, the
//! `Emitter` protocol, and three backends (JSONL file, span tracer, signal
//! bridge) composed behind [`CompositeEmitter`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use attractor_types::Result;

// ---------------------------------------------------------------------------
// Canonical event type strings
// ---------------------------------------------------------------------------

pub const PIPELINE_STARTED: &str = "pipeline.started";
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
pub const PIPELINE_FAILED: &str = "pipeline.failed";
pub const PIPELINE_RESUMED: &str = "pipeline.resumed";
pub const NODE_STARTED: &str = "node.started";
pub const NODE_COMPLETED: &str = "node.completed";
pub const NODE_FAILED: &str = "node.failed";
pub const EDGE_SELECTED: &str = "edge.selected";
pub const CHECKPOINT_SAVED: &str = "checkpoint.saved";
pub const CONTEXT_UPDATED: &str = "context.updated";
pub const RETRY_TRIGGERED: &str = "retry.triggered";
pub const LOOP_DETECTED: &str = "loop.detected";
pub const VALIDATION_STARTED: &str = "validation.started";
pub const VALIDATION_COMPLETED: &str = "validation.completed";

/// Process-wide, never-reset sequence counter. Direct `PipelineEvent`
/// construction outside [`build_event`] yields `sequence = 0`.
static SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Immutable lifecycle record. `node_id` is `None` for pipeline-scope
/// events (`pipeline.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub pipeline_id: String,
    pub node_id: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub sequence: u64,
}

/// Construct an event with the next process-monotonic sequence number and
/// the current UTC timestamp. This is the only sanctioned way to build an
/// event for real emission; `PipelineEvent { .. sequence: 0 .. }` literals
/// are reserved for tests asserting on the "unsequenced" default.
pub fn build_event(
    event_type: &str,
    pipeline_id: impl Into<String>,
    node_id: Option<String>,
    data: HashMap<String, serde_json::Value>,
) -> PipelineEvent {
    PipelineEvent {
        event_type: event_type.to_string(),
        timestamp: Utc::now(),
        pipeline_id: pipeline_id.into(),
        node_id,
        data,
        span_id: None,
        sequence: next_sequence(),
    }
}

// ---------------------------------------------------------------------------
// Emitter protocol
// ---------------------------------------------------------------------------

/// Structural emitter protocol. Both methods are non-raising: a backend
/// that cannot emit logs a warning and otherwise does nothing.
#[async_trait]
pub trait Emitter: Send + Sync {
    async fn emit(&self, event: PipelineEvent);
    async fn aclose(&self);
}

/// Discards every event. Used as the emitter for unit tests and anywhere a
/// real backend isn't wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

#[async_trait]
impl Emitter for NullEmitter {
    async fn emit(&self, _event: PipelineEvent) {}
    async fn aclose(&self) {}
}

/// Fans an event out to every configured backend concurrently. A backend
/// that panics or otherwise fails to complete is isolated — the others
/// still receive the event and `emit`/`aclose` still return normally.
pub struct CompositeEmitter {
    backends: Vec<Arc<dyn Emitter>>,
}

impl CompositeEmitter {
    pub fn new(backends: Vec<Arc<dyn Emitter>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl Emitter for CompositeEmitter {
    async fn emit(&self, event: PipelineEvent) {
        let mut set = tokio::task::JoinSet::new();
        for backend in &self.backends {
            let backend = backend.clone();
            let event = event.clone();
            set.spawn(async move { backend.emit(event).await });
        }
        while set.join_next().await.is_some() {}
    }

    async fn aclose(&self) {
        let mut set = tokio::task::JoinSet::new();
        for backend in &self.backends {
            let backend = backend.clone();
            set.spawn(async move { backend.aclose().await });
        }
        while set.join_next().await.is_some() {}
    }
}

// ---------------------------------------------------------------------------
// JSONL file backend
// ---------------------------------------------------------------------------

/// Appends one JSON line per event to `{run_dir}/pipeline-events.jsonl`.
/// Opened in append mode so a resumed run accumulates rather than
/// truncates. After `aclose`, further emits are dropped with a warning.
pub struct JsonlEmitter {
    file: tokio::sync::Mutex<Option<std::fs::File>>,
}

impl JsonlEmitter {
    pub fn new(run_dir: &Path) -> std::io::Result<Self> {
        let path = run_dir.join("pipeline-events.jsonl");
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: tokio::sync::Mutex::new(Some(file)) })
    }
}

#[async_trait]
impl Emitter for JsonlEmitter {
    async fn emit(&self, event: PipelineEvent) {
        use std::io::Write;
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            tracing::warn!("jsonl event emitter is closed, dropping event");
            return;
        };
        match serde_json::to_string(&event) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    tracing::warn!(error = %e, "failed to write event to jsonl log");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
        }
    }

    async fn aclose(&self) {
        let mut guard = self.file.lock().await;
        *guard = None;
    }
}

// ---------------------------------------------------------------------------
// Span tracer backend
// ---------------------------------------------------------------------------

/// Mirrors the event stream onto `tracing` spans: one pipeline-scope span
/// opened on `pipeline.started` and closed on `pipeline.completed`/
/// `pipeline.failed`, and a per-node span opened on `node.started` and
/// closed on `node.completed`/`node.failed`. Non-span event types are
/// ignored.
pub struct SpanTracerEmitter {
    state: tokio::sync::Mutex<SpanTracerState>,
}

#[derive(Default)]
struct SpanTracerState {
    pipeline_span: Option<tracing::Span>,
    node_spans: HashMap<String, tracing::Span>,
    failed: bool,
}

impl Default for SpanTracerEmitter {
    fn default() -> Self {
        Self { state: tokio::sync::Mutex::new(SpanTracerState::default()) }
    }
}

impl SpanTracerEmitter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Emitter for SpanTracerEmitter {
    async fn emit(&self, event: PipelineEvent) {
        let mut state = self.state.lock().await;
        if state.failed {
            return;
        }
        match event.event_type.as_str() {
            PIPELINE_STARTED | PIPELINE_RESUMED => {
                state.pipeline_span = Some(tracing::info_span!("pipeline", pipeline_id = %event.pipeline_id));
            }
            PIPELINE_COMPLETED | PIPELINE_FAILED => {
                state.pipeline_span = None;
            }
            NODE_STARTED => {
                if let Some(node_id) = event.node_id.clone() {
                    let span = tracing::info_span!("handler", node_id = %node_id);
                    state.node_spans.insert(node_id, span);
                }
            }
            NODE_COMPLETED | NODE_FAILED => {
                if let Some(node_id) = &event.node_id {
                    state.node_spans.remove(node_id);
                }
            }
            _ => {}
        }
    }

    async fn aclose(&self) {
        let mut state = self.state.lock().await;
        state.pipeline_span = None;
        state.node_spans.clear();
    }
}

// ---------------------------------------------------------------------------
// Signal bridge backend
// ---------------------------------------------------------------------------

/// Stateless. Translates exactly four event types into filesystem signal
/// files under `{run_dir}/signals/`; every other event is ignored.
pub struct SignalBridgeEmitter {
    signals_dir: PathBuf,
}

impl SignalBridgeEmitter {
    pub fn new(run_dir: &Path) -> Self {
        Self { signals_dir: run_dir.join("signals") }
    }
}

#[async_trait]
impl Emitter for SignalBridgeEmitter {
    async fn emit(&self, event: PipelineEvent) {
        let node_id = event.node_id.clone().unwrap_or_default();
        let result = match event.event_type.as_str() {
            PIPELINE_COMPLETED => {
                let mut payload = HashMap::new();
                payload.insert("pipeline_id".to_string(), serde_json::json!(event.pipeline_id));
                payload.insert("node_id".to_string(), serde_json::json!(node_id));
                payload.insert(
                    "duration_ms".to_string(),
                    event.data.get("duration_ms").cloned().unwrap_or(serde_json::json!(null)),
                );
                payload.insert(
                    "total_tokens".to_string(),
                    event.data.get("total_tokens").cloned().unwrap_or(serde_json::json!(null)),
                );
                crate::signal::write_bridge_signal(
                    &self.signals_dir,
                    "node_complete.json",
                    "engine",
                    &node_id,
                    "NODE_COMPLETE",
                    payload,
                )
            }
            PIPELINE_FAILED => {
                let mut payload = HashMap::new();
                payload.insert("pipeline_id".to_string(), serde_json::json!(event.pipeline_id));
                payload.insert("node_id".to_string(), serde_json::json!(node_id));
                payload.insert(
                    "error_type".to_string(),
                    event.data.get("error_type").cloned().unwrap_or(serde_json::json!(null)),
                );
                payload.insert(
                    "error_message".to_string(),
                    event.data.get("error_message").cloned().unwrap_or(serde_json::json!(null)),
                );
                crate::signal::write_bridge_signal(
                    &self.signals_dir,
                    "orchestrator_crashed.json",
                    "engine",
                    &node_id,
                    "ORCHESTRATOR_CRASHED",
                    payload,
                )
            }
            NODE_FAILED if event.data.get("goal_gate") == Some(&serde_json::Value::Bool(true)) => {
                let mut payload = HashMap::new();
                payload.insert("pipeline_id".to_string(), serde_json::json!(event.pipeline_id));
                payload.insert("node_id".to_string(), serde_json::json!(node_id));
                payload.insert(
                    "error_type".to_string(),
                    event.data.get("error_type").cloned().unwrap_or(serde_json::json!(null)),
                );
                payload.insert(
                    "reason".to_string(),
                    event.data.get("reason").cloned().unwrap_or(serde_json::json!(null)),
                );
                crate::signal::write_bridge_signal(
                    &self.signals_dir,
                    "violation.json",
                    "engine",
                    &node_id,
                    "VIOLATION",
                    payload,
                )
            }
            LOOP_DETECTED => {
                let mut payload = HashMap::new();
                payload.insert("pipeline_id".to_string(), serde_json::json!(event.pipeline_id));
                payload.insert("node_id".to_string(), serde_json::json!(node_id));
                payload.insert(
                    "visit_count".to_string(),
                    event.data.get("visit_count").cloned().unwrap_or(serde_json::json!(null)),
                );
                payload.insert(
                    "limit".to_string(),
                    event.data.get("limit").cloned().unwrap_or(serde_json::json!(null)),
                );
                payload.insert(
                    "last_output".to_string(),
                    event.data.get("last_output").cloned().unwrap_or(serde_json::json!(null)),
                );
                crate::signal::write_bridge_signal(
                    &self.signals_dir,
                    "orchestrator_stuck.json",
                    "engine",
                    &node_id,
                    "ORCHESTRATOR_STUCK",
                    payload,
                )
            }
            _ => return,
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "signal bridge write failed");
        }
    }

    async fn aclose(&self) {}
}

// ---------------------------------------------------------------------------
// Composition root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct EventBusConfig {
    pub enable_span_tracer: bool,
    pub enable_signal_bridge: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { enable_span_tracer: true, enable_signal_bridge: true }
    }
}

/// A non-empty `run_dir` always yields a JSONL backend; the span tracer and
/// signal bridge are toggled by `config`. Callers must `aclose()` the
/// returned emitter regardless of how the run ends.
pub fn build_emitter(run_dir: &Path, config: &EventBusConfig) -> Result<CompositeEmitter> {
    let mut backends: Vec<Arc<dyn Emitter>> = vec![Arc::new(JsonlEmitter::new(run_dir)?)];
    if config.enable_span_tracer {
        backends.push(Arc::new(SpanTracerEmitter::new()));
    }
    if config.enable_signal_bridge {
        backends.push(Arc::new(SignalBridgeEmitter::new(run_dir)));
    }
    Ok(CompositeEmitter::new(backends))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_strictly_increasing() {
        let a = build_event(PIPELINE_STARTED, "p", None, HashMap::new());
        let b = build_event(PIPELINE_STARTED, "p", None, HashMap::new());
        assert!(b.sequence > a.sequence);
    }

    #[tokio::test]
    async fn jsonl_emitter_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = JsonlEmitter::new(dir.path()).unwrap();
        emitter.emit(build_event(NODE_STARTED, "p", Some("n1".into()), HashMap::new())).await;
        emitter.emit(build_event(NODE_COMPLETED, "p", Some("n1".into()), HashMap::new())).await;
        emitter.aclose().await;

        let contents = std::fs::read_to_string(dir.path().join("pipeline-events.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn jsonl_emitter_reopen_appends_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        {
            let emitter = JsonlEmitter::new(dir.path()).unwrap();
            emitter.emit(build_event(PIPELINE_STARTED, "p", None, HashMap::new())).await;
        }
        {
            let emitter = JsonlEmitter::new(dir.path()).unwrap();
            emitter.emit(build_event(PIPELINE_COMPLETED, "p", None, HashMap::new())).await;
        }
        let contents = std::fs::read_to_string(dir.path().join("pipeline-events.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn jsonl_emitter_drops_events_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = JsonlEmitter::new(dir.path()).unwrap();
        emitter.aclose().await;
        emitter.emit(build_event(NODE_STARTED, "p", Some("n1".into()), HashMap::new())).await;
        let contents = std::fs::read_to_string(dir.path().join("pipeline-events.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 0);
    }

    #[tokio::test]
    async fn signal_bridge_writes_orchestrator_stuck_on_loop_detected() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = SignalBridgeEmitter::new(dir.path());
        let mut data = HashMap::new();
        data.insert("visit_count".to_string(), serde_json::json!(4));
        data.insert("limit".to_string(), serde_json::json!(3));
        emitter.emit(build_event(LOOP_DETECTED, "p", Some("body".into()), data)).await;
        assert!(dir.path().join("signals/orchestrator_stuck.json").exists());
    }

    #[tokio::test]
    async fn signal_bridge_ignores_unrelated_events() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = SignalBridgeEmitter::new(dir.path());
        emitter.emit(build_event(NODE_STARTED, "p", Some("n".into()), HashMap::new())).await;
        assert!(!dir.path().join("signals").exists());
    }

    #[tokio::test]
    async fn composite_emitter_fans_out_to_all_backends() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = Arc::new(JsonlEmitter::new(dir.path()).unwrap());
        let bridge = Arc::new(SignalBridgeEmitter::new(dir.path()));
        let composite = CompositeEmitter::new(vec![jsonl.clone(), bridge]);
        let mut data = HashMap::new();
        data.insert("visit_count".to_string(), serde_json::json!(1));
        composite.emit(build_event(LOOP_DETECTED, "p", Some("n".into()), data)).await;
        composite.aclose().await;

        let contents = std::fs::read_to_string(dir.path().join("pipeline-events.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(dir.path().join("signals/orchestrator_stuck.json").exists());
    }

    #[test]
    fn build_emitter_always_creates_jsonl_backend() {
        let dir = tempfile::tempdir().unwrap();
        let emitter = build_emitter(dir.path(), &EventBusConfig::default()).unwrap();
        assert_eq!(emitter.backends.len(), 3);
    }
}
