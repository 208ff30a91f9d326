//! The pipeline runner: parses a graph, sets up a checkpointed run
//! directory, and drives the main execution loop described in the crate's
//! design notes — resolve current node, dispatch through the middleware
//! chain, apply the outcome, select the next edge, repeat until an exit
//! node is reached or a fatal error propagates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use attractor_types::{
    EngineError, Outcome, PipelineContext, Result, KEY_COMPLETED_NODES, KEY_LAST_STATUS, KEY_PIPELINE_DURATION_S,
    KEY_PIPELINE_ID, KEY_RETRY_COUNT, KEY_TOTAL_TOKENS,
};
use chrono::Utc;
use serde_json::Value;

use crate::checkpoint::{CheckpointManager, EngineCheckpoint, NodeRecord};
use crate::condition::{ConditionEvaluator, StubConditionEvaluator};
use crate::edge_selection::select_edge;
use crate::events::{
    build_emitter, build_event, Emitter, EventBusConfig, LOOP_DETECTED, PIPELINE_COMPLETED, PIPELINE_FAILED,
    PIPELINE_RESUMED, PIPELINE_STARTED, VALIDATION_COMPLETED, VALIDATION_STARTED,
};
use crate::graph::Graph;
use crate::handler::{default_registry, HandlerRegistry};
use crate::middleware::{default_chain, MiddlewareChain};
use crate::validation::{self, Severity};

const DEFAULT_MAX_NODE_VISITS: u32 = 10;

pub struct RunnerConfig {
    pub dot_path: PathBuf,
    pub pipelines_dir: PathBuf,
    pub resume_run_dir: Option<PathBuf>,
    pub max_node_visits: u32,
    pub initial_context: HashMap<String, Value>,
    pub event_bus: EventBusConfig,
}

impl RunnerConfig {
    pub fn new(dot_path: impl Into<PathBuf>, pipelines_dir: impl Into<PathBuf>) -> Self {
        Self {
            dot_path: dot_path.into(),
            pipelines_dir: pipelines_dir.into(),
            resume_run_dir: None,
            max_node_visits: DEFAULT_MAX_NODE_VISITS,
            initial_context: HashMap::new(),
            event_bus: EventBusConfig::default(),
        }
    }

    pub fn with_resume(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.resume_run_dir = Some(run_dir.into());
        self
    }

    pub fn with_max_node_visits(mut self, max: u32) -> Self {
        self.max_node_visits = max;
        self
    }

    pub fn with_initial_context(mut self, context: HashMap<String, Value>) -> Self {
        self.initial_context = context;
        self
    }
}

pub struct Runner {
    registry: Arc<HandlerRegistry>,
    evaluator: Arc<dyn ConditionEvaluator>,
    middleware: MiddlewareChain,
}

impl Runner {
    pub fn new() -> Self {
        Self { registry: Arc::new(default_registry()), evaluator: Arc::new(StubConditionEvaluator), middleware: default_chain() }
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    pub async fn run(&self, config: RunnerConfig) -> Result<EngineCheckpoint> {
        let graph = Arc::new(parse_graph(&config.dot_path)?);
        let pipeline_id = derive_pipeline_id(&graph, &config.dot_path);

        let run_dir = match &config.resume_run_dir {
            Some(dir) => dir.clone(),
            None => CheckpointManager::create_run_dir(&config.pipelines_dir, &pipeline_id, Utc::now())?,
        };
        let checkpoint_manager = CheckpointManager::new(run_dir.clone());
        let mut checkpoint = checkpoint_manager.load_or_create(&pipeline_id, &config.dot_path.display().to_string(), Some(graph.node_ids()))?;

        let emitter: Arc<dyn Emitter> = Arc::new(build_emitter(&run_dir, &config.event_bus)?);

        emitter.emit(build_event(VALIDATION_STARTED, pipeline_id.clone(), None, HashMap::new())).await;
        let diagnostics = validation::validate(&graph);
        let error_count = diagnostics.iter().filter(|d| d.severity == Severity::Error).count();
        for d in &diagnostics {
            match d.severity {
                Severity::Error => tracing::warn!(rule = %d.rule, node = ?d.node_id, "{}", d.message),
                Severity::Warning => tracing::info!(rule = %d.rule, node = ?d.node_id, "{}", d.message),
            }
        }
        let mut validation_data = HashMap::new();
        validation_data.insert("diagnostic_count".to_string(), serde_json::json!(diagnostics.len()));
        validation_data.insert("error_count".to_string(), serde_json::json!(error_count));
        emitter.emit(build_event(VALIDATION_COMPLETED, pipeline_id.clone(), None, validation_data)).await;

        let context = PipelineContext::from_map(config.initial_context.clone());
        context.update(checkpoint.context.clone()).await;
        context.set(KEY_PIPELINE_ID, serde_json::json!(pipeline_id)).await;
        context.set(KEY_COMPLETED_NODES, serde_json::json!(checkpoint.completed_nodes)).await;

        let is_resume = !checkpoint.completed_nodes.is_empty();
        let started_event = if is_resume { PIPELINE_RESUMED } else { PIPELINE_STARTED };
        emitter.emit(build_event(started_event, pipeline_id.clone(), None, HashMap::new())).await;

        let run_result = self.run_loop(&graph, &pipeline_id, &run_dir, &context, &emitter, &checkpoint_manager, &mut checkpoint, config.max_node_visits).await;

        match &run_result {
            Ok(()) => {
                emitter.emit(build_event(PIPELINE_COMPLETED, pipeline_id.clone(), None, HashMap::new())).await;
            }
            Err(e) => {
                let mut data = HashMap::new();
                data.insert("error_type".to_string(), serde_json::json!(e.error_type()));
                data.insert("error_message".to_string(), serde_json::json!(e.to_string()));
                emitter.emit(build_event(PIPELINE_FAILED, pipeline_id.clone(), checkpoint.current_node_id.clone(), data)).await;
            }
        }
        emitter.aclose().await;

        run_result?;
        Ok(checkpoint)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        graph: &Arc<Graph>,
        pipeline_id: &str,
        run_dir: &Path,
        context: &PipelineContext,
        emitter: &Arc<dyn Emitter>,
        checkpoint_manager: &CheckpointManager,
        checkpoint: &mut EngineCheckpoint,
        max_node_visits: u32,
    ) -> Result<()> {
        let started_at = Utc::now();

        let mut current_node_id = resolve_start_node(graph, checkpoint)?;

        loop {
            let node = graph.node(&current_node_id).ok_or_else(|| EngineError::Validation(format!("node '{current_node_id}' not found in graph")))?;

            let visit_count = context.increment_visit(&current_node_id).await;
            if visit_count > max_node_visits {
                let mut data = HashMap::new();
                data.insert("visit_count".to_string(), serde_json::json!(visit_count));
                data.insert("limit".to_string(), serde_json::json!(max_node_visits));
                emitter.emit(build_event(LOOP_DETECTED, pipeline_id.to_string(), Some(current_node_id.clone()), data)).await;
                return Err(EngineError::LoopDetected { node_id: current_node_id.clone(), visit_count, max_visits: max_node_visits });
            }

            let retry_count = checkpoint.node_records.iter().filter(|r| r.node_id == current_node_id).count() as u64;
            context.set(KEY_RETRY_COUNT, serde_json::json!(retry_count)).await;
            context.set(KEY_PIPELINE_DURATION_S, serde_json::json!(Utc::now().signed_duration_since(started_at).num_milliseconds() as f64 / 1000.0)).await;
            context.set(KEY_COMPLETED_NODES, serde_json::json!(checkpoint.completed_nodes)).await;

            checkpoint.current_node_id = Some(current_node_id.clone());
            checkpoint_manager.save(checkpoint);

            let request = crate::handler::HandlerRequest {
                node: Arc::new(node.clone()),
                graph: graph.clone(),
                context: context.clone(),
                emitter: emitter.clone(),
                registry: self.registry.clone(),
                pipeline_id: pipeline_id.to_string(),
                visit_count,
                attempt_number: 1,
                run_dir: run_dir.to_path_buf(),
            };

            let handler = self.registry.dispatch(node)?;
            let started_handler_at = Utc::now();
            let outcome = self.middleware.execute(&request, handler).await?;
            let completed_handler_at = Utc::now();

            context.update(outcome.context_updates.clone()).await;
            context.set(KEY_LAST_STATUS, serde_json::json!(outcome.status.as_wire_str())).await;
            if let Some(tokens) = outcome.metadata.get("tokens_used").and_then(|v| v.as_u64()) {
                checkpoint.total_tokens_used += tokens;
                context.set(KEY_TOTAL_TOKENS, serde_json::json!(checkpoint.total_tokens_used)).await;
            }

            checkpoint.node_records.push(NodeRecord {
                node_id: current_node_id.clone(),
                handler_type: node.shape.clone(),
                status: outcome.status,
                context_updates: outcome.context_updates.clone(),
                preferred_label: outcome.preferred_label.clone(),
                suggested_next: outcome.suggested_next.clone(),
                metadata: outcome.metadata.clone(),
                started_at: started_handler_at,
                completed_at: completed_handler_at,
            });
            if !checkpoint.completed_nodes.contains(&current_node_id) {
                checkpoint.completed_nodes.push(current_node_id.clone());
            }
            checkpoint.visit_counts.insert(current_node_id.clone(), visit_count);
            checkpoint.total_node_executions += 1;
            checkpoint.context = context.snapshot().await;
            checkpoint_manager.save(checkpoint);

            if node.shape == "exit" {
                if outcome.is_failure() {
                    return Err(EngineError::Handler {
                        node_id: current_node_id.clone(),
                        message: "exit node reported goal gates unsatisfied".to_string(),
                        cause: None,
                    });
                }
                return Ok(());
            }

            let context_snapshot = context.snapshot().await;
            let edge = select_edge(graph, &current_node_id, &outcome, &context_snapshot, self.evaluator.as_ref())?;
            let edge_id = edge.id();
            let next_id = edge.target.clone();
            let loop_restart = edge.loop_restart;

            checkpoint.last_edge_id = Some(edge_id.clone());
            let mut data = HashMap::new();
            data.insert("edge_id".to_string(), serde_json::json!(edge_id));
            data.insert("target".to_string(), serde_json::json!(next_id));
            emitter.emit(build_event(crate::events::EDGE_SELECTED, pipeline_id.to_string(), Some(current_node_id.clone()), data)).await;

            if loop_restart {
                checkpoint.completed_nodes.clear();
                checkpoint.node_records.clear();
            }

            current_node_id = next_id;
        }
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_graph(dot_path: &Path) -> Result<Graph> {
    let text = std::fs::read_to_string(dot_path)?;
    let dot = attractor_dot::parse(&text)?;
    Graph::from_dot(dot)
}

fn derive_pipeline_id(graph: &Graph, dot_path: &Path) -> String {
    if !graph.name.trim().is_empty() {
        return graph.name.clone();
    }
    dot_path.file_stem().and_then(|s| s.to_str()).unwrap_or("pipeline").to_string()
}

/// Mid-execution crash resume: if the checkpoint names a `current_node_id`
/// that is not yet completed and still exists in the graph, re-enter
/// there. Otherwise fall back to the unique start node.
fn resolve_start_node(graph: &Graph, checkpoint: &EngineCheckpoint) -> Result<String> {
    if let Some(id) = &checkpoint.current_node_id {
        if !checkpoint.completed_nodes.contains(id) && graph.node(id).is_some() {
            return Ok(id.clone());
        }
    }
    graph
        .start_node()
        .map(|n| n.id.clone())
        .ok_or_else(|| EngineError::Validation("graph has no start node".to_string()))
}
