//! Generic node: an escape hatch for executor types this crate doesn't
//! model directly. Dispatches through the same `ActionExecutor` action
//! nodes use, under a `generic:<executor_type>` handler id, so embedding
//! applications can register custom node behavior without a new
//! `NodeVariant` (§3 Non-goals: custom executor plugin API is out of
//! scope for the engine itself, but the dispatch seam is not).

use std::collections::HashMap;

use async_trait::async_trait;

use crate::action::ActionInvocation;
use crate::state::{HensuState, NodeResult};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{Node, NodeVariant, Workflow};
use crate::Result;

pub struct GenericExecutor;

#[async_trait]
impl NodeExecutor for GenericExecutor {
    async fn execute(
        &self,
        node: &Node,
        _workflow: &Workflow,
        _state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::Generic(g) => g,
            _ => unreachable!("GenericExecutor invoked on non-generic node"),
        };

        let mut payload = HashMap::new();
        payload.insert("config".to_string(), spec.config.clone());

        let invocation = ActionInvocation {
            handler_id: format!("generic:{}", spec.executor_type),
            payload,
        };

        match deps.actions.execute(&invocation).await {
            Ok(value) => Ok(NodeResult::success(value.to_string(), HashMap::new())),
            Err(e) => Ok(NodeResult::failure(e.to_string())),
        }
    }
}
