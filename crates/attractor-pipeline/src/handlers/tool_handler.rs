//! `ToolHandler` — executes `node.tool_command` as a shell subprocess
//! (shape `tool`, DOT `parallelogram`).

use async_trait::async_trait;
use attractor_types::{EngineError, Outcome, Result};
use std::time::Duration;

use crate::handler::{HandlerRequest, NodeHandler};

const DEFAULT_TIMEOUT_SECS: u64 = 300;

pub struct ToolHandler {
    timeout: Duration,
}

impl ToolHandler {
    pub fn new() -> Self {
        let secs = std::env::var("ATTRACTOR_TOOL_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Self { timeout: Duration::from_secs(secs) }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ToolHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for ToolHandler {
    fn handler_type(&self) -> &str {
        "tool"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Outcome> {
        let command = request.node.tool_command().ok_or_else(|| EngineError::Handler {
            node_id: request.node.id.clone(),
            message: "missing tool_command attribute".to_string(),
            cause: None,
        })?;

        tracing::info!(node = %request.node.id, command = %command, "running tool command");

        let node_dir = request.node_run_dir();
        std::fs::create_dir_all(&node_dir).map_err(|e| EngineError::Handler {
            node_id: request.node.id.clone(),
            message: format!("failed to create node run dir: {e}"),
            cause: Some(Box::new(e)),
        })?;

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(&request.run_dir);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(|e| EngineError::Handler {
            node_id: request.node.id.clone(),
            message: format!("failed to spawn tool command: {e}"),
            cause: Some(Box::new(e)),
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| EngineError::Handler {
                node_id: request.node.id.clone(),
                message: format!("tool command execution failed: {e}"),
                cause: Some(Box::new(e)),
            })?,
            Err(_) => {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert("error_type".to_string(), serde_json::json!("TIMEOUT"));
                metadata.insert("timeout_s".to_string(), serde_json::json!(self.timeout.as_secs()));
                return Ok(Outcome::failure().with_metadata(metadata));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        std::fs::write(node_dir.join(format!("{}.stdout", request.node.id)), &stdout).map_err(io_err(request, "stdout"))?;
        std::fs::write(node_dir.join(format!("{}.stderr", request.node.id)), &stderr).map_err(io_err(request, "stderr"))?;
        std::fs::write(node_dir.join(format!("{}.exit_code", request.node.id)), exit_code.to_string()).map_err(io_err(request, "exit_code"))?;

        tracing::info!(node = %request.node.id, exit_code, stdout_len = stdout.len(), stderr_len = stderr.len(), "tool command completed");

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("exit_code".to_string(), serde_json::json!(exit_code));

        if output.status.success() {
            Ok(Outcome::success().with_metadata(metadata))
        } else {
            Ok(Outcome::failure().with_metadata(metadata))
        }
    }
}

fn io_err<'a>(request: &'a HandlerRequest, what: &'static str) -> impl FnOnce(std::io::Error) -> EngineError + 'a {
    move |e| EngineError::Handler {
        node_id: request.node.id.clone(),
        message: format!("failed to write {what}: {e}"),
        cause: Some(Box::new(e)),
    }
}
