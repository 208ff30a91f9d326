//! Filesystem signal-file rendezvous protocol.
//!
//! External workers (a tmux-driven coding agent, a human approval UI, a
//! shell tool) communicate completion back to the engine by dropping a file
//! under a node's `signals/` directory. Writers use write-to-tmp-then-rename
//! so a half-written file is never observed by a poller; readers simply
//! check for the file's existence and parse its JSON body if present.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

/// Atomically write `payload` (or `{}` when `None`) to `dir/file_name`.
/// Creates `dir` if missing. The staging file lives in the same directory
/// as the target so the rename is guaranteed atomic on the same filesystem.
pub fn write_signal(
    dir: &Path,
    file_name: &str,
    payload: Option<&serde_json::Value>,
) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let target = dir.join(file_name);
    let tmp = dir.join(format!(".{file_name}.tmp"));
    let body = payload.cloned().unwrap_or_else(|| serde_json::json!({}));
    std::fs::write(&tmp, serde_json::to_vec_pretty(&body)?)?;
    std::fs::rename(&tmp, &target)?;
    Ok(())
}

/// Returns `Some(payload)` (possibly `{}`) if `dir/file_name` exists.
/// A present-but-unparseable file still counts as present, with an empty
/// object payload — a torn read should never be mistaken for absence.
pub fn poll_signal(dir: &Path, file_name: &str) -> Option<serde_json::Value> {
    let path = dir.join(file_name);
    if !path.exists() {
        return None;
    }
    let bytes = std::fs::read(&path).ok();
    Some(
        bytes
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or_else(|| serde_json::json!({})),
    )
}

/// Write a pipeline-scope or node-scope signal-bridge payload: `{source,
/// target, signal_type, payload}`, atomically.
pub fn write_bridge_signal(
    dir: &Path,
    file_name: &str,
    source: &str,
    target: &str,
    signal_type: &str,
    payload: HashMap<String, serde_json::Value>,
) -> std::io::Result<()> {
    let body = serde_json::json!({
        "source": source,
        "target": target,
        "signal_type": signal_type,
        "payload": payload,
    });
    write_signal(dir, file_name, Some(&body))
}

/// Injectable collaborator that actually launches external work for a
/// `codegen` node (a tmux pane running a coding agent, in the real
/// orchestrator this crate is extracted from). This crate ships only a
/// no-op default; embedders supply a real implementation.
#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(
        &self,
        node_id: &str,
        prompt_path: &Path,
        run_dir: &Path,
    ) -> std::io::Result<()>;
}

/// Default `Spawner`: shells a no-op command and relies entirely on
/// whatever external process independently watches `prompt.md` and drops
/// the completion signal file. Embedders own a real orchestrator and
/// inject it via `CodegenHandler::with_spawner`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpawner;

#[async_trait]
impl Spawner for NoopSpawner {
    async fn spawn(
        &self,
        node_id: &str,
        prompt_path: &Path,
        _run_dir: &Path,
    ) -> std::io::Result<()> {
        tracing::debug!(node = %node_id, prompt = %prompt_path.display(), "noop spawner invoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_poll_roundtrips_payload() {
        let dir = tempfile::tempdir().unwrap();
        let payload = serde_json::json!({"feedback": "looks good"});
        write_signal(dir.path(), "node-complete.signal", Some(&payload)).unwrap();
        let read_back = poll_signal(dir.path(), "node-complete.signal").unwrap();
        assert_eq!(read_back["feedback"], "looks good");
    }

    #[test]
    fn poll_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(poll_signal(dir.path(), "absent.signal").is_none());
    }

    #[test]
    fn write_with_no_payload_yields_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        write_signal(dir.path(), "done.signal", None).unwrap();
        let body = poll_signal(dir.path(), "done.signal").unwrap();
        assert_eq!(body, serde_json::json!({}));
    }

    #[tokio::test]
    async fn noop_spawner_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = dir.path().join("prompt.md");
        std::fs::write(&prompt, "do the thing").unwrap();
        NoopSpawner.spawn("n1", &prompt, dir.path()).await.unwrap();
    }
}
