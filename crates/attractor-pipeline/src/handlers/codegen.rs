//! `CodegenHandler` — dispatches a node's prompt to an external
//! orchestrator process (a coding agent in a tmux pane, in practice) and
//! awaits completion through the filesystem signal protocol
//! (shape `codegen`, DOT `box`).

use async_trait::async_trait;
use attractor_types::{EngineError, Outcome, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::graph::DispatchStrategy;
use crate::handler::{HandlerRequest, NodeHandler};
use crate::signal::{poll_signal, NoopSpawner, Spawner};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 3600;

/// Synchronous in-process query callable used by the `sdk` dispatch
/// strategy. This crate ships no bundled LLM SDK, so the default
/// configuration has none registered and `sdk` falls back to `tmux`.
#[async_trait]
pub trait QueryCallable: Send + Sync {
    async fn query(&self, prompt: &str) -> Result<Outcome>;
}

pub struct CodegenHandler {
    spawner: Arc<dyn Spawner>,
    query_callable: Option<Arc<dyn QueryCallable>>,
    poll_interval: Duration,
    handler_timeout: Duration,
}

impl CodegenHandler {
    pub fn new() -> Self {
        Self {
            spawner: Arc::new(NoopSpawner),
            query_callable: None,
            poll_interval: env_duration("ATTRACTOR_SIGNAL_POLL_INTERVAL", DEFAULT_POLL_INTERVAL_SECS),
            handler_timeout: env_duration("ATTRACTOR_HANDLER_TIMEOUT", DEFAULT_HANDLER_TIMEOUT_SECS),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_query_callable(mut self, query_callable: Arc<dyn QueryCallable>) -> Self {
        self.query_callable = Some(query_callable);
        self
    }

    async fn run_tmux(&self, request: &HandlerRequest) -> Result<Outcome> {
        let node_dir = request.node_run_dir();
        let signals_dir = node_dir.join("signals");
        std::fs::create_dir_all(&signals_dir).map_err(io_err(request, "create signals dir"))?;

        let prompt = request.node.prompt().unwrap_or_default();
        let prompt_path = node_dir.join("prompt.md");
        std::fs::write(&prompt_path, prompt).map_err(io_err(request, "write prompt.md"))?;

        self.spawner.spawn(&request.node.id, &prompt_path, &request.run_dir).await.map_err(|e| EngineError::Handler {
            node_id: request.node.id.clone(),
            message: format!("spawner failed: {e}"),
            cause: Some(Box::new(e)),
        })?;

        let complete_name = format!("{}-complete.signal", request.node.id);
        let failed_name = format!("{}-failed.signal", request.node.id);
        let review_name = format!("{}-needs-review.signal", request.node.id);

        let started = Instant::now();
        loop {
            if let Some(payload) = poll_signal(&signals_dir, &complete_name) {
                return self.write_outcome_and_return(&node_dir, Outcome::success().with_metadata(metadata_from(payload)));
            }
            if let Some(payload) = poll_signal(&signals_dir, &failed_name) {
                return self.write_outcome_and_return(&node_dir, Outcome::failure().with_metadata(metadata_from(payload)));
            }
            if let Some(payload) = poll_signal(&signals_dir, &review_name) {
                return self.write_outcome_and_return(&node_dir, Outcome::partial_success().with_metadata(metadata_from(payload)));
            }

            if started.elapsed() >= self.handler_timeout {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert("error_type".to_string(), serde_json::json!("TIMEOUT"));
                return self.write_outcome_and_return(&node_dir, Outcome::failure().with_metadata(metadata));
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn write_outcome_and_return(&self, node_dir: &std::path::Path, outcome: Outcome) -> Result<Outcome> {
        let body = serde_json::json!({
            "status": outcome.status.as_wire_str(),
            "metadata": outcome.metadata,
        });
        if let Err(e) = std::fs::write(node_dir.join("outcome.json"), serde_json::to_vec_pretty(&body).unwrap_or_default()) {
            tracing::warn!(error = %e, "failed to write outcome.json");
        }
        Ok(outcome)
    }

    async fn run_sdk(&self, request: &HandlerRequest) -> Result<Outcome> {
        match &self.query_callable {
            Some(query) => {
                let prompt = request.node.prompt().unwrap_or_default();
                match query.query(prompt).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        tracing::warn!(node = %request.node.id, error = %e, "sdk dispatch failed, falling back to tmux");
                        self.run_tmux(request).await
                    }
                }
            }
            None => {
                tracing::warn!(node = %request.node.id, "no query callable configured, falling back to tmux");
                self.run_tmux(request).await
            }
        }
    }
}

impl Default for CodegenHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn metadata_from(payload: serde_json::Value) -> std::collections::HashMap<String, serde_json::Value> {
    match payload {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => std::collections::HashMap::new(),
    }
}

fn env_duration(var: &str, default_secs: u64) -> Duration {
    Duration::from_secs(std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default_secs))
}

fn io_err<'a>(request: &'a HandlerRequest, what: &'static str) -> impl FnOnce(std::io::Error) -> EngineError + 'a {
    move |e| EngineError::Handler { node_id: request.node.id.clone(), message: format!("failed to {what}: {e}"), cause: Some(Box::new(e)) }
}

#[async_trait]
impl NodeHandler for CodegenHandler {
    fn handler_type(&self) -> &str {
        "codegen"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Outcome> {
        match request.node.dispatch_strategy() {
            DispatchStrategy::Tmux | DispatchStrategy::Inline => self.run_tmux(request).await,
            DispatchStrategy::Sdk => self.run_sdk(request).await,
        }
    }
}
