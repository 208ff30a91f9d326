//! `HumanWaitHandler` — pauses pipeline execution for an external approval
//! decision delivered through the filesystem signal protocol
//! (shape `human-wait`, DOT `hexagon`).

use async_trait::async_trait;
use attractor_types::{Outcome, Result};
use chrono::Utc;
use std::time::Duration;

use crate::handler::{HandlerRequest, NodeHandler};
use crate::signal::poll_signal;

const RESPONSE_SIGNAL: &str = "INPUT_RESPONSE.signal";

fn gate_started_key(node_id: &str) -> String {
    format!("$human_wait_started.{node_id}")
}

/// Waits indefinitely unless `ATTRACTOR_HUMAN_GATE_TIMEOUT` is set. Each
/// call is a single poll — the runner re-enters the handler on the next
/// loop tick rather than this handler blocking and sleeping itself, since
/// a human gate may outlive any one process.
pub struct HumanWaitHandler {
    timeout: Option<Duration>,
}

impl HumanWaitHandler {
    pub fn new() -> Self {
        let timeout = std::env::var("ATTRACTOR_HUMAN_GATE_TIMEOUT").ok().and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs);
        Self { timeout }
    }
}

impl Default for HumanWaitHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeHandler for HumanWaitHandler {
    fn handler_type(&self) -> &str {
        "human-wait"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Outcome> {
        let signals_dir = request.node_run_dir().join("signals");

        if let Some(payload) = poll_signal(&signals_dir, RESPONSE_SIGNAL) {
            let response = payload.get("response").and_then(|v| v.as_str()).unwrap_or("");
            return Ok(match response {
                "approve" => Outcome::success().with_metadata(metadata_from(payload)),
                "reject" => Outcome::failure().with_metadata(metadata_from(payload)),
                _ => Outcome::waiting(),
            });
        }

        if let Some(timeout) = self.timeout {
            let key = gate_started_key(&request.node.id);
            let now = Utc::now();
            let started = match request.context.get(&key).await.and_then(|v| v.as_str().map(str::to_string)) {
                Some(raw) => raw.parse::<chrono::DateTime<Utc>>().unwrap_or(now),
                None => {
                    request.context.set(key.clone(), serde_json::json!(now.to_rfc3339())).await;
                    now
                }
            };
            if now.signed_duration_since(started).to_std().unwrap_or_default() >= timeout {
                let mut metadata = std::collections::HashMap::new();
                metadata.insert("error_type".to_string(), serde_json::json!("TIMEOUT"));
                return Ok(Outcome::failure().with_metadata(metadata));
            }
        }

        Ok(Outcome::waiting())
    }
}

fn metadata_from(payload: serde_json::Value) -> std::collections::HashMap<String, serde_json::Value> {
    match payload {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => std::collections::HashMap::new(),
    }
}
