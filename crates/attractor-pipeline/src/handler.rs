//! Node handler trait, dynamic dispatch wrapper, and the shape→handler registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use attractor_types::{EngineError, Outcome, PipelineContext, Result};

use crate::events::Emitter;
use crate::graph::{Graph, Node};

// ---------------------------------------------------------------------------
// HandlerRequest
// ---------------------------------------------------------------------------

/// Everything a handler needs to execute one node. Cheap to clone (every
/// field is an `Arc`, a `String`, or a small `Copy` value) — the retry
/// middleware produces a fresh copy per attempt with `attempt_number`
/// incremented.
#[derive(Clone)]
pub struct HandlerRequest {
    pub node: Arc<Node>,
    pub graph: Arc<Graph>,
    pub context: PipelineContext,
    pub emitter: Arc<dyn Emitter>,
    pub registry: Arc<HandlerRegistry>,
    pub pipeline_id: String,
    pub visit_count: u32,
    pub attempt_number: u32,
    pub run_dir: PathBuf,
}

impl HandlerRequest {
    pub fn node_run_dir(&self) -> PathBuf {
        self.run_dir.join("nodes").join(&self.node.id)
    }

    pub fn with_attempt(&self, attempt_number: u32) -> Self {
        let mut next = self.clone();
        next.attempt_number = attempt_number;
        next
    }

    /// Build a child request for a parallel branch: same graph/emitter/
    /// registry/run_dir, but the node and context are the branch's own.
    pub fn for_child(&self, node: Arc<Node>, context: PipelineContext) -> Self {
        Self {
            node,
            context,
            graph: self.graph.clone(),
            emitter: self.emitter.clone(),
            registry: self.registry.clone(),
            pipeline_id: self.pipeline_id.clone(),
            visit_count: 1,
            attempt_number: 1,
            run_dir: self.run_dir.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The shape this handler is registered under (e.g. "start", "codegen").
    fn handler_type(&self) -> &str;

    async fn execute(&self, request: &HandlerRequest) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// DynHandler — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn NodeHandler>);

impl DynHandler {
    pub fn new(handler: impl NodeHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn handler_type(&self) -> &str {
        self.0.handler_type()
    }

    pub async fn execute(&self, request: &HandlerRequest) -> Result<Outcome> {
        self.0.execute(request).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Maps a node's semantic `shape` to the handler that executes it. Built
/// once at startup (via [`default_registry`]); tests may construct a bare
/// registry and register a subset.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, shape: impl Into<String>, handler: impl NodeHandler + 'static) {
        self.handlers.insert(shape.into(), DynHandler::new(handler));
    }

    #[tracing::instrument(skip(self, node), fields(node_id = %node.id, shape = %node.shape))]
    pub fn dispatch(&self, node: &Node) -> Result<&DynHandler> {
        self.handlers.get(&node.shape).ok_or_else(|| EngineError::UnknownShape {
            shape: node.shape.clone(),
            node_id: node.id.clone(),
        })
    }

    pub fn has(&self, shape: &str) -> bool {
        self.handlers.contains_key(shape)
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers: start / exit / conditional
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(&self, _request: &HandlerRequest) -> Result<Outcome> {
        Ok(Outcome::skipped())
    }
}

pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    async fn execute(&self, _request: &HandlerRequest) -> Result<Outcome> {
        Ok(Outcome::success())
    }
}

/// The exit handler computes whether the run is a success by checking every
/// goal-gate node (`goal_gate=true` on a `codegen`, `human-wait`, or
/// `parallel` node) has appeared in `$completed_nodes`.
pub struct ExitHandler;

impl ExitHandler {
    fn goal_gate_node_ids(graph: &Graph) -> Vec<String> {
        graph
            .nodes()
            .filter(|n| n.goal_gate() && matches!(n.shape.as_str(), "codegen" | "human-wait" | "parallel"))
            .map(|n| n.id.clone())
            .collect()
    }
}

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Outcome> {
        let completed: Vec<String> = request
            .context
            .get(attractor_types::KEY_COMPLETED_NODES)
            .await
            .and_then(|v| v.as_array().cloned())
            .map(|arr| arr.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let completed_set: std::collections::HashSet<&str> = completed.iter().map(String::as_str).collect();

        let mut missing: Vec<String> = Self::goal_gate_node_ids(&request.graph)
            .into_iter()
            .filter(|id| !completed_set.contains(id.as_str()))
            .collect();
        missing.sort();

        if missing.is_empty() {
            let signal_dir = request.run_dir.join("signals");
            if let Err(e) = crate::signal::write_signal(&signal_dir, "pipeline_complete.signal", None) {
                tracing::warn!(error = %e, "failed to write pipeline_complete.signal");
            }
            Ok(Outcome::success().with_context_updates([(
                "$pipeline_outcome".to_string(),
                serde_json::json!("success"),
            )]))
        } else {
            Ok(Outcome::failure().with_context_updates([(
                "$missing_goal_gates".to_string(),
                serde_json::json!(missing),
            )]))
        }
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

pub fn default_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register("start", StartHandler);
    reg.register("exit", ExitHandler);
    reg.register("conditional", ConditionalHandler);
    reg.register("tool", crate::handlers::ToolHandler::new());
    reg.register("codegen", crate::handlers::CodegenHandler::new());
    reg.register("human-wait", crate::handlers::HumanWaitHandler::new());
    reg.register("parallel", crate::handlers::ParallelHandler);
    reg.register("fan-in", crate::handlers::FanInHandler);
    reg.register("manager-loop", crate::handlers::ManagerLoopHandler);
    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEmitter;
    use std::collections::HashMap as Map;

    fn make_node(id: &str, shape: &str, attrs: Map<String, serde_json::Value>) -> Node {
        Node {
            id: id.to_string(),
            shape: shape.to_string(),
            label: None,
            attrs,
        }
    }

    fn minimal_graph() -> Graph {
        Graph::from_dot(
            attractor_dot::parse(r#"digraph G { start [shape="Mdiamond"] done [shape="Msquare"] start -> done }"#)
                .unwrap(),
        )
        .unwrap()
    }

    fn request_for(node: Node, graph: Graph) -> HandlerRequest {
        HandlerRequest {
            node: Arc::new(node),
            graph: Arc::new(graph),
            context: PipelineContext::new(),
            emitter: Arc::new(NullEmitter),
            registry: Arc::new(default_registry()),
            pipeline_id: "p".to_string(),
            visit_count: 1,
            attempt_number: 1,
            run_dir: std::env::temp_dir(),
        }
    }

    #[test]
    fn dispatch_unknown_shape_errors() {
        let reg = default_registry();
        let node = make_node("n", "nonexistent-shape", Map::new());
        let err = reg.dispatch(&node).unwrap_err();
        assert!(matches!(err, EngineError::UnknownShape { .. }));
    }

    #[test]
    fn dispatch_known_shape_succeeds() {
        let reg = default_registry();
        let node = make_node("s", "start", Map::new());
        assert!(reg.dispatch(&node).is_ok());
    }

    #[tokio::test]
    async fn start_handler_returns_skipped() {
        let handler = StartHandler;
        let req = request_for(make_node("s", "start", Map::new()), minimal_graph());
        let outcome = handler.execute(&req).await.unwrap();
        assert_eq!(outcome.status, attractor_types::OutcomeStatus::Skipped);
    }

    #[tokio::test]
    async fn conditional_handler_returns_success() {
        let handler = ConditionalHandler;
        let req = request_for(make_node("c", "conditional", Map::new()), minimal_graph());
        let outcome = handler.execute(&req).await.unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn exit_handler_succeeds_when_goal_gates_satisfied() {
        let graph = Graph::from_dot(
            attractor_dot::parse(
                r#"digraph G {
                    start [shape="Mdiamond"]
                    build [shape="box", goal_gate=true]
                    done [shape="Msquare"]
                    start -> build -> done
                }"#,
            )
            .unwrap(),
        )
        .unwrap();
        let mut req = request_for(make_node("done", "exit", Map::new()), graph);
        req.context
            .set(attractor_types::KEY_COMPLETED_NODES, serde_json::json!(["start", "build"]))
            .await;
        let outcome = ExitHandler.execute(&req).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.context_updates["$pipeline_outcome"], serde_json::json!("success"));
    }

    #[tokio::test]
    async fn exit_handler_fails_when_goal_gate_missing() {
        let graph = Graph::from_dot(
            attractor_dot::parse(
                r#"digraph G {
                    start [shape="Mdiamond"]
                    build [shape="box", goal_gate=true]
                    done [shape="Msquare"]
                    start -> build -> done
                }"#,
            )
            .unwrap(),
        )
        .unwrap();
        let mut req = request_for(make_node("done", "exit", Map::new()), graph);
        req.context.set(attractor_types::KEY_COMPLETED_NODES, serde_json::json!(["start"])).await;
        let outcome = ExitHandler.execute(&req).await.unwrap();
        assert!(outcome.is_failure());
        assert_eq!(
            outcome.context_updates["$missing_goal_gates"],
            serde_json::json!(["build"])
        );
    }

    #[test]
    fn default_registry_has_all_nine_shapes() {
        let reg = default_registry();
        for shape in [
            "start",
            "exit",
            "conditional",
            "codegen",
            "human-wait",
            "parallel",
            "fan-in",
            "tool",
            "manager-loop",
        ] {
            assert!(reg.has(shape), "missing handler for shape {shape}");
        }
    }
}
