//! Pipeline execution engine: DOT graph traversal, handler dispatch, five-step
//! edge selection, crash-safe checkpointing, and the structured event bus.

pub mod checkpoint;
pub mod condition;
pub mod edge_selection;
pub mod events;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod middleware;
pub mod runner;
pub mod signal;
pub mod validation;

pub use checkpoint::{CheckpointManager, EngineCheckpoint, NodeRecord, SCHEMA_VERSION};
pub use condition::{
    evaluate_condition, parse_condition, Clause, ConditionEvaluator, ConditionExpr, Operator,
    RichConditionEvaluator, StubConditionEvaluator,
};
pub use edge_selection::select_edge;
pub use events::{
    build_emitter, build_event, CompositeEmitter, Emitter, EventBusConfig, JsonlEmitter, NullEmitter,
    PipelineEvent, SignalBridgeEmitter, SpanTracerEmitter,
};
pub use graph::{DispatchStrategy, Edge, Graph, GraphAttrs, JoinPolicy, Node};
pub use handler::{
    default_registry, ConditionalHandler, DynHandler, ExitHandler, HandlerRegistry, HandlerRequest, NodeHandler,
    StartHandler,
};
pub use handlers::{CodegenHandler, FanInHandler, HumanWaitHandler, ManagerLoopHandler, ParallelHandler, ToolHandler};
pub use middleware::{
    AuditEntry, AuditMiddleware, AuditWriter, Middleware, MiddlewareChain, Next, NullAuditWriter, RetryMiddleware,
    SpanMiddleware, TokenCountMiddleware, default_chain,
};
pub use runner::{Runner, RunnerConfig};
pub use signal::{poll_signal, write_bridge_signal, write_signal, NoopSpawner, Spawner};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
