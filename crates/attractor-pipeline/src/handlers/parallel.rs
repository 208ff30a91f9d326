//! `ParallelHandler` (shape `parallel`, DOT `component`) and `FanInHandler`
//! (shape `fan-in`, DOT `tripleoctagon`).

use async_trait::async_trait;
use attractor_types::{Outcome, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::graph::JoinPolicy;
use crate::handler::{HandlerRequest, NodeHandler};

/// Resolves its children as the direct successors of the node, runs each
/// concurrently against an isolated context snapshot, and merges results
/// back into the parent context under a `<branch_id>.<key>` namespace —
/// including a synthetic `<branch_id>.$status` entry so a downstream
/// fan-in node can recover branch outcomes without a shared status map.
/// Also writes a `$<node_id>.results` map of branch id to status so a
/// caller can read the whole fan-out's outcome in one place.
pub struct ParallelHandler;

#[async_trait]
impl NodeHandler for ParallelHandler {
    fn handler_type(&self) -> &str {
        "parallel"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Outcome> {
        let branch_ids: Vec<String> = request.graph.outgoing_edges(&request.node.id).into_iter().map(|e| e.target.clone()).collect();
        if branch_ids.is_empty() {
            return Ok(Outcome::success());
        }

        let mut set = tokio::task::JoinSet::new();
        for branch_id in &branch_ids {
            let Some(child_node) = request.graph.node(branch_id).cloned() else {
                tracing::warn!(node = %request.node.id, branch = %branch_id, "parallel branch target not found in graph");
                continue;
            };
            let branch_context = request.context.snapshot_isolated().await;
            let child_request = request.for_child(Arc::new(child_node), branch_context);
            let branch_id = branch_id.clone();
            set.spawn(async move {
                let outcome = match child_request.registry.dispatch(child_request.node.as_ref()) {
                    Ok(handler) => handler.execute(&child_request).await,
                    Err(e) => Err(e),
                };
                (branch_id, outcome)
            });
        }

        match request.node.join_policy() {
            JoinPolicy::WaitAll => self.run_wait_all(&request.node.id, set).await,
            JoinPolicy::FirstSuccess => self.run_first_success(&request.node.id, set).await,
        }
    }
}

impl ParallelHandler {
    async fn run_wait_all(&self, node_id: &str, mut set: tokio::task::JoinSet<(String, Result<Outcome>)>) -> Result<Outcome> {
        let mut context_updates = HashMap::new();
        let mut results = serde_json::Map::new();
        let mut all_succeeded = true;

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((branch_id, Ok(outcome))) => {
                    namespace_into(&branch_id, &outcome, &mut context_updates);
                    results.insert(branch_id, serde_json::json!(outcome.status.as_wire_str()));
                    all_succeeded &= outcome.is_success();
                }
                Ok((branch_id, Err(e))) => {
                    tracing::warn!(branch = %branch_id, error = %e, "parallel branch failed with a handler error");
                    results.insert(branch_id, serde_json::json!("failure"));
                    all_succeeded = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "parallel branch task panicked");
                    all_succeeded = false;
                }
            }
        }
        context_updates.insert(format!("${node_id}.results"), Value::Object(results));

        Ok(if all_succeeded { Outcome::success().with_context_updates(context_updates) } else { Outcome::failure().with_context_updates(context_updates) })
    }

    async fn run_first_success(&self, node_id: &str, mut set: tokio::task::JoinSet<(String, Result<Outcome>)>) -> Result<Outcome> {
        let mut winner = None;
        let mut results = serde_json::Map::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((branch_id, Ok(outcome))) => {
                    results.insert(branch_id.clone(), serde_json::json!(outcome.status.as_wire_str()));
                    if outcome.is_success() && winner.is_none() {
                        winner = Some((branch_id, outcome));
                        break;
                    }
                }
                Ok((branch_id, Err(e))) => {
                    tracing::warn!(branch = %branch_id, error = %e, "parallel branch failed with a handler error");
                    results.insert(branch_id, serde_json::json!("failure"));
                }
                Err(e) => tracing::warn!(error = %e, "parallel branch task panicked"),
            }
        }

        // Cancel the remaining branches; their eventual cancellation errors
        // are drained and ignored rather than surfaced.
        set.abort_all();
        while set.join_next().await.is_some() {}

        let mut context_updates = HashMap::new();
        context_updates.insert(format!("${node_id}.results"), Value::Object(results));

        match winner {
            Some((branch_id, outcome)) => {
                namespace_into(&branch_id, &outcome, &mut context_updates);
                Ok(Outcome::success().with_context_updates(context_updates))
            }
            None => Ok(Outcome::failure().with_context_updates(context_updates)),
        }
    }
}

fn namespace_into(branch_id: &str, outcome: &Outcome, context_updates: &mut HashMap<String, Value>) {
    for (k, v) in &outcome.context_updates {
        context_updates.insert(format!("{branch_id}.{k}"), v.clone());
    }
    context_updates.insert(format!("{branch_id}.$status"), serde_json::json!(outcome.status.as_wire_str()));
}

/// Rendezvous point for a `parallel` node's branches. Prefers an explicit
/// `$fan_in.{node_id}.results` map (written by an embedder-side
/// coordinator); otherwise recovers branch statuses from the
/// `<branch_id>.$status` keys the upstream `ParallelHandler` namespaced
/// into the context. A fan-in with no branch results at all is a no-op
/// success — a lone `fan-in` node reached directly, with nothing to merge.
pub struct FanInHandler;

#[async_trait]
impl NodeHandler for FanInHandler {
    fn handler_type(&self) -> &str {
        "fan-in"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Outcome> {
        let snapshot = request.context.snapshot().await;
        let explicit_key = format!("$fan_in.{}.results", request.node.id);

        let mut statuses: HashMap<String, String> = HashMap::new();
        if let Some(Value::Object(map)) = snapshot.get(&explicit_key) {
            for (branch, status) in map {
                if let Some(s) = status.as_str() {
                    statuses.insert(branch.clone(), s.to_string());
                }
            }
        } else {
            for edge in request.graph.incoming_edges(&request.node.id) {
                let status_key = format!("{}.$status", edge.source);
                if let Some(status) = snapshot.get(&status_key).and_then(|v| v.as_str()) {
                    statuses.insert(edge.source.clone(), status.to_string());
                }
            }
        }

        if statuses.is_empty() {
            return Ok(Outcome::success());
        }

        let outcome_success = match request.node.join_policy() {
            JoinPolicy::WaitAll => statuses.values().all(|s| s == "success"),
            JoinPolicy::FirstSuccess => statuses.values().any(|s| s == "success"),
        };

        Ok(if outcome_success { Outcome::success() } else { Outcome::failure() })
    }
}
