//! Loop node: repeatedly run a body chain until a break condition
//! matches or `max_iterations` is reached (§3).
//!
//! The body is whatever subgraph the workflow author wires from
//! `body_target` back to this node's id; each iteration runs that
//! subgraph via `ChainRunner::run_until`, stopping as soon as control
//! returns to this node.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;

use crate::state::{HensuState, NodeResult};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{Node, NodeVariant, Workflow};
use crate::workflow::transitions::extract_score;

pub struct LoopExecutor;

#[async_trait]
impl NodeExecutor for LoopExecutor {
    async fn execute(
        &self,
        node: &Node,
        workflow: &Workflow,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> crate::Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::Loop(l) => l,
            _ => unreachable!("LoopExecutor invoked on non-loop node"),
        };

        let stop_nodes: HashSet<String> = HashSet::from([node.id.clone()]);
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            let (next_state, _body_result) = deps
                .chain_runner
                .run_until(&spec.body_target, &stop_nodes, workflow, state.clone(), &deps.cancellation)
                .await?;
            *state = next_state;

            let score = extract_score(state).unwrap_or(0.0);
            if let Some(rule) = spec.break_rules.iter().find(|r| r.condition.matches(score)) {
                state.loop_break_target = Some(rule.target.clone());
                let mut metadata = HashMap::new();
                metadata.insert("iterations".to_string(), Value::from(iterations));
                return Ok(NodeResult::success(
                    format!("loop broke after {iterations} iteration(s)"),
                    metadata,
                ));
            }

            if iterations >= spec.max_iterations {
                return Ok(NodeResult::failure(format!(
                    "loop exceeded max_iterations ({})",
                    spec.max_iterations
                )));
            }
        }
    }
}
