//! Standard node: a single agent call, optionally followed by a plan
//! sub-state-machine when the node enables tool use (§4.2, §4.7).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::agent::AgentResponse;
use crate::plan::{Plan, PlanConstraints, PlanExecutor, PlanOutcome};
use crate::state::{HensuState, NodeResult};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{Node, NodeVariant, PlanningMode, Workflow};
use crate::Result;

pub struct StandardExecutor;

#[async_trait]
impl NodeExecutor for StandardExecutor {
    async fn execute(
        &self,
        node: &Node,
        workflow: &Workflow,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::Standard(s) => s,
            _ => unreachable!("StandardExecutor invoked on non-standard node"),
        };

        let agent_config = workflow
            .agents
            .get(&spec.agent_id)
            .expect("validated at workflow construction");
        let agent = deps.agents.resolve(&spec.agent_id, agent_config)?;

        let prompt = deps.resolver.resolve(&spec.prompt, &state.context);
        let timeout = Duration::from_secs(
            spec.timeout_seconds
                .unwrap_or(workflow.config.default_timeout_seconds),
        );
        let response = match tokio::time::timeout(timeout, agent.execute(&prompt, &state.context)).await
        {
            Ok(r) => r,
            Err(_) => {
                return Ok(NodeResult::failure(format!(
                    "agent call for node '{}' exceeded timeout of {timeout:?}",
                    node.id
                )))
            }
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => return Ok(NodeResult::failure(e.to_string())),
        };

        match response {
            AgentResponse::Text(text) => {
                deps.validator.validate(&text.content)?;
                let mut metadata = HashMap::new();
                metadata.insert("model".to_string(), Value::String(text.model));
                if let Some(tokens) = text.tokens_used {
                    metadata.insert("tokens_used".to_string(), Value::from(tokens));
                }
                Ok(NodeResult::success(text.content, metadata))
            }
            AgentResponse::Error(message) => Ok(NodeResult::failure(message)),
            AgentResponse::ToolRequest(req) => {
                if spec.planning_mode != PlanningMode::Enabled {
                    return Ok(NodeResult::failure(
                        "agent requested a tool call but this node has planning disabled",
                    ));
                }
                let plan = crate::plan::static_plan(vec![(
                    req.tool_name.clone(),
                    req.arguments.clone(),
                    "agent tool request".to_string(),
                )]);
                self.run_plan(plan, node, spec, state, deps).await
            }
            AgentResponse::PlanProposal(plan) => {
                if spec.planning_mode != PlanningMode::Enabled {
                    return Ok(NodeResult::failure(
                        "agent proposed a plan but this node has planning disabled",
                    ));
                }
                self.run_plan(plan, node, spec, state, deps).await
            }
        }
    }
}

impl StandardExecutor {
    async fn run_plan(
        &self,
        plan: Plan,
        node: &Node,
        spec: &crate::workflow::model::StandardNode,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let constraints = PlanConstraints {
            max_steps: spec.max_plan_steps.unwrap_or_else(|| PlanConstraints::default().max_steps),
            max_replans: spec.max_plan_replans.unwrap_or_else(|| PlanConstraints::default().max_replans),
            ..PlanConstraints::default()
        };

        let runner = PlanExecutor::new(
            deps.actions.as_ref(),
            &crate::plan::NullPlanObserver,
            &deps.resolver,
            constraints,
        );

        match runner.run(plan, &state.context, node.review.review_plan).await? {
            PlanOutcome::Completed { success, output } => {
                if success {
                    let text = output.map(|v| v.to_string()).unwrap_or_default();
                    Ok(NodeResult::success(text, HashMap::new()))
                } else {
                    let mut result = NodeResult::failure("plan execution failed");
                    if let Some(target) = &spec.plan_failure_target {
                        result
                            .metadata
                            .insert("target_override".to_string(), Value::String(target.clone()));
                    }
                    Ok(result)
                }
            }
            PlanOutcome::Paused(snapshot) => {
                state.active_plan = Some(snapshot);
                Ok(NodeResult::success("plan paused for review", HashMap::new()))
            }
        }
    }
}
