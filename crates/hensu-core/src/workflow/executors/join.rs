//! Join node: wait on the fork branches it names and merge their
//! outputs per the configured strategy (§3, §4.2).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::state::{HensuState, NodeResult};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{JoinNode, MergeStrategy, Node, NodeVariant, Workflow};
use crate::{HensuError, Result};

pub struct JoinExecutor;

#[async_trait]
impl NodeExecutor for JoinExecutor {
    async fn execute(
        &self,
        node: &Node,
        _workflow: &Workflow,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::Join(j) => j,
            _ => unreachable!("JoinExecutor invoked on non-join node"),
        };

        let mut branch_values = Vec::with_capacity(spec.await_targets.len());
        for target in &spec.await_targets {
            let result = deps
                .fork_registry
                .take(state.execution_id, target)
                .await
                .ok_or_else(|| HensuError::MissingNode(format!(
                    "join awaits target '{target}' but no fork branch was spawned for it"
                )))?;
            let value = serde_json::json!({
                "success": result.is_success(),
                "output": result.output,
            });
            branch_values.push((target.clone(), value));
        }

        let merged = merge(spec, &branch_values)?;

        let mut metadata = HashMap::new();
        if let Some(field) = &spec.output_field {
            state.context.insert(field.clone(), merged.clone());
            metadata.insert("output_field".to_string(), Value::String(field.clone()));
        }

        let all_succeeded = branch_values
            .iter()
            .all(|(_, v)| v.get("success").and_then(|s| s.as_bool()).unwrap_or(false));

        if all_succeeded {
            Ok(NodeResult::success(merged.to_string(), metadata))
        } else {
            let mut result = NodeResult::failure("one or more joined branches failed");
            result.metadata.extend(metadata);
            Ok(result)
        }
    }
}

fn merge(spec: &JoinNode, branch_values: &[(String, Value)]) -> Result<Value> {
    match spec.merge_strategy {
        MergeStrategy::CollectAll => Ok(Value::Array(
            branch_values.iter().map(|(_, v)| v.clone()).collect(),
        )),
        MergeStrategy::FirstCompleted => Ok(branch_values
            .first()
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)),
        MergeStrategy::Concatenate => {
            let joined = branch_values
                .iter()
                .filter_map(|(_, v)| v.get("output").and_then(|o| o.as_str()))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(Value::String(joined))
        }
        MergeStrategy::MergeMaps => {
            let mut map = serde_json::Map::new();
            for (target, value) in branch_values {
                map.insert(target.clone(), value.clone());
            }
            Ok(Value::Object(map))
        }
        MergeStrategy::Custom => {
            let name = spec.custom_merge_fn.as_deref().ok_or_else(|| {
                HensuError::Definition("custom merge strategy requires custom_merge_fn".to_string())
            })?;
            Err(HensuError::ActionHandlerMissing(format!(
                "no custom merge function registered for '{name}'"
            )))
        }
    }
}
