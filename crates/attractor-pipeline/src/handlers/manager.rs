//! `ManagerLoopHandler` (shape `manager-loop`, DOT `house`) — reserved for
//! recursive sub-pipeline execution in a spawned subprocess. The shape is
//! fully parsed and registered; this stub simply refuses to execute it.

use async_trait::async_trait;
use attractor_types::{EngineError, Outcome, Result};

use crate::handler::{HandlerRequest, NodeHandler};

pub struct ManagerLoopHandler;

#[async_trait]
impl NodeHandler for ManagerLoopHandler {
    fn handler_type(&self) -> &str {
        "manager-loop"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Outcome> {
        Err(EngineError::Handler {
            node_id: request.node.id.clone(),
            message: format!("manager-loop is not implemented (node {}, shape manager-loop)", request.node.id),
            cause: None,
        })
    }
}
