//! Sub-workflow node: invoke another workflow to completion, mapping
//! context keys in and out (§3).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::state::{HensuState, NodeResult};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{Node, NodeVariant, Workflow};
use crate::Result;

pub struct SubWorkflowExecutor;

#[async_trait]
impl NodeExecutor for SubWorkflowExecutor {
    async fn execute(
        &self,
        node: &Node,
        _workflow: &Workflow,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::SubWorkflow(s) => s,
            _ => unreachable!("SubWorkflowExecutor invoked on non-sub-workflow node"),
        };

        let mut input_context: HashMap<String, Value> = HashMap::new();
        for (from_key, to_key) in &spec.input_mapping {
            if let Some(value) = state.context.get(from_key) {
                input_context.insert(to_key.clone(), value.clone());
            }
        }

        let output_context = match deps
            .sub_workflows
            .run(&spec.workflow_id, input_context, &deps.cancellation)
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => return Ok(NodeResult::failure(e.to_string())),
        };

        for (from_key, to_key) in &spec.output_mapping {
            if let Some(value) = output_context.get(from_key) {
                state.context.insert(to_key.clone(), value.clone());
            }
        }

        Ok(NodeResult::success(
            format!("sub-workflow '{}' completed", spec.workflow_id),
            HashMap::new(),
        ))
    }
}
