//! Action node: a single handler invocation with no agent involved
//! (§3).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::ActionInvocation;
use crate::state::{HensuState, NodeResult};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{Action, Node, NodeVariant, Workflow};
use crate::Result;

pub struct ActionNodeExecutor;

#[async_trait]
impl NodeExecutor for ActionNodeExecutor {
    async fn execute(
        &self,
        node: &Node,
        _workflow: &Workflow,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::Action(a) => a,
            _ => unreachable!("ActionNodeExecutor invoked on non-action node"),
        };

        let (handler_id, raw_payload) = match &spec.action {
            Action::Send { handler_id, payload } => (handler_id.clone(), payload.clone()),
            Action::Execute { command_id, args } => (command_id.clone(), args.clone()),
        };

        let payload: HashMap<String, Value> = raw_payload
            .into_iter()
            .map(|(k, v)| {
                let resolved = match v {
                    Value::String(s) => Value::String(deps.resolver.resolve(&s, &state.context)),
                    other => other,
                };
                (k, resolved)
            })
            .collect();

        let invocation = ActionInvocation { handler_id, payload };
        match deps.actions.execute(&invocation).await {
            Ok(value) => Ok(NodeResult::success(value.to_string(), HashMap::new())),
            Err(e) => Ok(NodeResult::failure(e.to_string())),
        }
    }
}
