//! Crash-safe checkpoint persistence: atomic write-then-rename,
//! schema/graph-shape validation on load, and the run directory layout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use attractor_types::{EngineError, OutcomeStatus, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exact-match schema version. No migrations — a checkpoint written by a
/// different version is refused outright.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// One entry per completed handler invocation (not per node — a revisited
/// node appears multiple times).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub handler_type: String,
    pub status: OutcomeStatus,
    #[serde(default)]
    pub context_updates: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub preferred_label: Option<String>,
    #[serde(default)]
    pub suggested_next: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Single source of truth for crash recovery. Replaced wholesale
/// (copy-on-write) on every save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCheckpoint {
    pub schema_version: String,
    pub pipeline_id: String,
    pub dot_path: String,
    pub run_dir: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub completed_nodes: Vec<String>,
    pub node_records: Vec<NodeRecord>,
    pub current_node_id: Option<String>,
    pub last_edge_id: Option<String>,
    pub context: HashMap<String, serde_json::Value>,
    pub visit_counts: HashMap<String, u32>,
    pub total_node_executions: u64,
    pub total_tokens_used: u64,
}

impl EngineCheckpoint {
    fn fresh(pipeline_id: &str, dot_path: &str, run_dir: &Path) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            pipeline_id: pipeline_id.to_string(),
            dot_path: dot_path.to_string(),
            run_dir: run_dir.display().to_string(),
            started_at: now,
            last_updated_at: now,
            completed_nodes: Vec::new(),
            node_records: Vec::new(),
            current_node_id: None,
            last_edge_id: None,
            context: HashMap::new(),
            visit_counts: HashMap::new(),
            total_node_executions: 0,
            total_tokens_used: 0,
        }
    }
}

/// Owns one run directory: `checkpoint.json` (authoritative),
/// `checkpoint.json.tmp` (staging), `manifest.json` (write-once),
/// `nodes/<id>/…` (per-node artefacts).
pub struct CheckpointManager {
    run_dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self { run_dir: run_dir.into() }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.run_dir.join("checkpoint.json")
    }

    fn tmp_path(&self) -> PathBuf {
        self.run_dir.join("checkpoint.json.tmp")
    }

    fn manifest_path(&self) -> PathBuf {
        self.run_dir.join("manifest.json")
    }

    /// Build `{pipelines_dir}/{pipeline_id}-run-{UTC timestamp
    /// yyyyMMddTHHmmssZ}`, creating it and its `nodes/` subdirectory.
    pub fn create_run_dir(
        pipelines_dir: &Path,
        pipeline_id: &str,
        timestamp: DateTime<Utc>,
    ) -> std::io::Result<PathBuf> {
        let stamp = timestamp.format("%Y%m%dT%H%M%SZ");
        let run_dir = pipelines_dir.join(format!("{pipeline_id}-run-{stamp}"));
        std::fs::create_dir_all(run_dir.join("nodes"))?;
        Ok(run_dir)
    }

    /// Write `manifest.json` if it does not already exist. Idempotent —
    /// a resumed run never rewrites it.
    pub fn write_manifest_if_absent(
        &self,
        pipeline_id: &str,
        dot_path: &str,
        started_at: DateTime<Utc>,
    ) -> std::io::Result<()> {
        let path = self.manifest_path();
        if path.exists() {
            return Ok(());
        }
        let manifest = serde_json::json!({
            "schema_version": SCHEMA_VERSION,
            "pipeline_id": pipeline_id,
            "dot_path": dot_path,
            "run_dir": self.run_dir.display().to_string(),
            "started_at": started_at,
        });
        std::fs::write(path, serde_json::to_vec_pretty(&manifest)?)
    }

    /// Atomic save: serialize to the tmp path, then rename over the target.
    /// Failure is caught and logged, never propagated — a lost save is
    /// recoverable on the next successful one; a crash mid-handler is not,
    /// which is why the pre-execute save in the runner's loop matters more
    /// than any individual save succeeding.
    pub fn save(&self, checkpoint: &mut EngineCheckpoint) -> bool {
        checkpoint.last_updated_at = Utc::now();
        match self.try_save(checkpoint) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, run_dir = %self.run_dir.display(), "checkpoint save failed");
                false
            }
        }
    }

    fn try_save(&self, checkpoint: &EngineCheckpoint) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.checkpoint_path())?;
        Ok(())
    }

    /// Load `checkpoint.json` if present and valid, or construct and persist
    /// a fresh one. `graph_node_ids`, when supplied, guards against a
    /// checkpoint referencing nodes the current graph no longer has.
    pub fn load_or_create(
        &self,
        pipeline_id: &str,
        dot_path: &str,
        graph_node_ids: Option<&[String]>,
    ) -> Result<EngineCheckpoint> {
        let path = self.checkpoint_path();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let checkpoint: EngineCheckpoint = serde_json::from_slice(&bytes)?;
            if checkpoint.schema_version != SCHEMA_VERSION {
                return Err(EngineError::CheckpointVersion {
                    found: checkpoint.schema_version,
                    expected: SCHEMA_VERSION.to_string(),
                    path: path.display().to_string(),
                });
            }
            if let Some(ids) = graph_node_ids {
                let known: std::collections::HashSet<&str> = ids.iter().map(String::as_str).collect();
                let missing: Vec<String> = checkpoint
                    .completed_nodes
                    .iter()
                    .filter(|id| !known.contains(id.as_str()))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(EngineError::CheckpointGraphMismatch {
                        missing_nodes: missing,
                        path: path.display().to_string(),
                    });
                }
            }
            return Ok(checkpoint);
        }

        let checkpoint = EngineCheckpoint::fresh(pipeline_id, dot_path, &self.run_dir);
        self.write_manifest_if_absent(pipeline_id, dot_path, checkpoint.started_at)?;
        Ok(checkpoint)
    }
}
