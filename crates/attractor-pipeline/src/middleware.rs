//! Right-to-left composed middleware chain wrapped around handler
//! execution: span/observability (outermost), audit, token counting, retry
//! (innermost, directly wrapping the handler).

use async_trait::async_trait;
use attractor_types::{Outcome, OutcomeStatus, Result, KEY_TOTAL_TOKENS};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

use crate::events::{build_event, CONTEXT_UPDATED, NODE_COMPLETED, NODE_FAILED, NODE_STARTED, RETRY_TRIGGERED};
use crate::handler::{DynHandler, HandlerRequest};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One link in the chain: receives the request and a `next` continuation
/// representing everything inward of it (the remaining middlewares, then
/// the handler itself).
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: &HandlerRequest, next: &Next<'_>) -> Result<Outcome>;
}

/// The continuation passed to a middleware: calling `run` invokes whatever
/// is inward of the current middleware.
pub struct Next<'a> {
    chain: &'a MiddlewareChain,
    index: usize,
    handler: &'a DynHandler,
}

impl<'a> Next<'a> {
    pub fn run(&self, request: &'a HandlerRequest) -> BoxFuture<'a, Result<Outcome>> {
        self.chain.dispatch(self.index, request, self.handler)
    }
}

/// An ordered list of middlewares; the first entry is the outermost
/// wrapper. An empty chain degenerates to a direct handler call.
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub async fn execute(&self, request: &HandlerRequest, handler: &DynHandler) -> Result<Outcome> {
        self.dispatch(0, request, handler).await
    }

    fn dispatch<'a>(&'a self, index: usize, request: &'a HandlerRequest, handler: &'a DynHandler) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            match self.middlewares.get(index) {
                Some(mw) => {
                    let next = Next { chain: self, index: index + 1, handler };
                    mw.handle(request, &next).await
                }
                None => handler.execute(request).await,
            }
        })
    }
}

/// Default wiring: Span (outermost) → Audit → Token count → Retry →
/// handler (innermost). Span must be outermost so its `node.started`/
/// `node.completed` pair brackets every retry attempt.
pub fn default_chain() -> MiddlewareChain {
    MiddlewareChain::new(vec![
        Arc::new(SpanMiddleware),
        Arc::new(AuditMiddleware::default()),
        Arc::new(TokenCountMiddleware),
        Arc::new(RetryMiddleware::default()),
    ])
}

// ---------------------------------------------------------------------------
// Span middleware
// ---------------------------------------------------------------------------

pub struct SpanMiddleware;

#[async_trait]
impl Middleware for SpanMiddleware {
    async fn handle(&self, request: &HandlerRequest, next: &Next<'_>) -> Result<Outcome> {
        request
            .emitter
            .emit(build_event(NODE_STARTED, request.pipeline_id.clone(), Some(request.node.id.clone()), HashMap::new()))
            .await;

        let span = tracing::info_span!("handler", node_id = %request.node.id, shape = %request.node.shape);
        let started_at = Instant::now();
        let result = next.run(request).instrument(span).await;
        let duration_ms = started_at.elapsed().as_millis() as u64;

        let mut data = HashMap::new();
        data.insert("handler_type".to_string(), serde_json::json!(request.node.shape));
        data.insert("visit_count".to_string(), serde_json::json!(request.visit_count));
        data.insert("duration_ms".to_string(), serde_json::json!(duration_ms));
        data.insert("goal_gate".to_string(), serde_json::json!(request.node.goal_gate()));

        match &result {
            Ok(outcome) => {
                data.insert("outcome_status".to_string(), serde_json::json!(outcome.status.as_wire_str()));
                let event_type = if outcome.status == OutcomeStatus::Failure { NODE_FAILED } else { NODE_COMPLETED };
                request
                    .emitter
                    .emit(build_event(event_type, request.pipeline_id.clone(), Some(request.node.id.clone()), data))
                    .await;
            }
            Err(e) => {
                data.insert("error_type".to_string(), serde_json::json!(e.error_type()));
                data.insert("error_message".to_string(), serde_json::json!(e.to_string()));
                request
                    .emitter
                    .emit(build_event(NODE_FAILED, request.pipeline_id.clone(), Some(request.node.id.clone()), data))
                    .await;
            }
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Retry middleware
// ---------------------------------------------------------------------------

pub struct RetryMiddleware {
    pub base_delay_secs: f64,
    pub retry_on_exception: bool,
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self { base_delay_secs: 1.0, retry_on_exception: false }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, request: &HandlerRequest, next: &Next<'_>) -> Result<Outcome> {
        let max_attempts = request.node.max_retries().max(1);
        let mut attempt = 1u32;
        loop {
            let attempt_request = request.with_attempt(attempt);
            let result = next.run(&attempt_request).await;
            let should_retry = match &result {
                Ok(outcome) => outcome.is_failure() && attempt < max_attempts,
                Err(_) => self.retry_on_exception && attempt < max_attempts,
            };
            if !should_retry {
                return result;
            }

            let delay_secs = self.base_delay_secs * 2f64.powi(attempt as i32 - 1);
            let mut data = HashMap::new();
            data.insert("attempt".to_string(), serde_json::json!(attempt));
            data.insert("delay_s".to_string(), serde_json::json!(delay_secs));
            request
                .emitter
                .emit(build_event(RETRY_TRIGGERED, request.pipeline_id.clone(), Some(request.node.id.clone()), data))
                .await;
            tokio::time::sleep(Duration::from_secs_f64(delay_secs)).await;
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Token count middleware
// ---------------------------------------------------------------------------

pub struct TokenCountMiddleware;

#[async_trait]
impl Middleware for TokenCountMiddleware {
    async fn handle(&self, request: &HandlerRequest, next: &Next<'_>) -> Result<Outcome> {
        let outcome = next.run(request).await?;
        if outcome.raw_messages.is_empty() {
            return Ok(outcome);
        }

        let node_tokens: u64 = outcome
            .raw_messages
            .iter()
            .filter_map(|m| m.get("usage"))
            .map(|usage| {
                let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                input + output
            })
            .sum();

        if node_tokens > 0 {
            let total_before = request.context.get(KEY_TOTAL_TOKENS).await.and_then(|v| v.as_u64()).unwrap_or(0);
            let total_after = total_before + node_tokens;
            request.context.set("$node_tokens", serde_json::json!(node_tokens)).await;
            request.context.set(KEY_TOTAL_TOKENS, serde_json::json!(total_after)).await;

            let mut data = HashMap::new();
            data.insert("$node_tokens".to_string(), serde_json::json!(node_tokens));
            data.insert(KEY_TOTAL_TOKENS.to_string(), serde_json::json!(total_after));
            request
                .emitter
                .emit(build_event(CONTEXT_UPDATED, request.pipeline_id.clone(), Some(request.node.id.clone()), data))
                .await;
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Audit middleware
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub node_id: String,
    pub from_status: String,
    pub to_status: String,
    pub agent_id: String,
}

/// Injected audit log writer. Implementations are responsible for catching
/// their own write failures and logging them — this trait has no `Result`
/// so a failing writer can never propagate an error into the run loop.
#[async_trait]
pub trait AuditWriter: Send + Sync {
    async fn write(&self, entry: AuditEntry);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditWriter;

#[async_trait]
impl AuditWriter for NullAuditWriter {
    async fn write(&self, _entry: AuditEntry) {}
}

pub struct AuditMiddleware {
    writer: Arc<dyn AuditWriter>,
}

impl AuditMiddleware {
    pub fn new(writer: Arc<dyn AuditWriter>) -> Self {
        Self { writer }
    }
}

impl Default for AuditMiddleware {
    fn default() -> Self {
        Self { writer: Arc::new(NullAuditWriter) }
    }
}

#[async_trait]
impl Middleware for AuditMiddleware {
    async fn handle(&self, request: &HandlerRequest, next: &Next<'_>) -> Result<Outcome> {
        let agent_id = request
            .context
            .get("$session_id")
            .await
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        self.writer
            .write(AuditEntry {
                node_id: request.node.id.clone(),
                from_status: "pending".to_string(),
                to_status: "active".to_string(),
                agent_id: agent_id.clone(),
            })
            .await;

        let result = next.run(request).await;

        let to_status = match &result {
            Ok(outcome) => outcome.status.as_wire_str().to_string(),
            Err(_) => "error".to_string(),
        };
        self.writer
            .write(AuditEntry { node_id: request.node.id.clone(), from_status: "active".to_string(), to_status, agent_id })
            .await;

        result
    }
}
