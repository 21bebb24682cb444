//! Parallel node: fan out to N agent branches, apply a consensus rule
//! over their individual success/failure (§3, §4.3).

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::agent::AgentResponse;
use crate::state::{HensuState, NodeResult, NodeStatus};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{Branch, ConsensusKind, Node, NodeVariant, Workflow};
use crate::Result;

pub struct ParallelExecutor;

struct BranchOutcome {
    branch_id: String,
    result: NodeResult,
    rubric_score: Option<f64>,
}

#[async_trait]
impl NodeExecutor for ParallelExecutor {
    async fn execute(
        &self,
        node: &Node,
        workflow: &Workflow,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::Parallel(p) => p,
            _ => unreachable!("ParallelExecutor invoked on non-parallel node"),
        };

        let kind = spec.consensus.as_ref().map(|c| c.kind).unwrap_or(ConsensusKind::All);

        let mut set: JoinSet<Result<BranchOutcome>> = JoinSet::new();
        for branch in &spec.branches {
            let branch = branch.clone();
            let agent_config = workflow
                .agents
                .get(&branch.agent_id)
                .expect("validated at workflow construction")
                .clone();
            let agent = deps.agents.resolve(&branch.agent_id, &agent_config)?;
            let prompt = deps.resolver.resolve(&branch.prompt, &state.context);
            let context = state.context.clone();
            let rubrics = deps.rubrics.clone();
            let branch_id = branch.id.clone();

            set.spawn(async move {
                run_branch(branch, agent, prompt, context, rubrics)
                    .await
                    .map_err(|e| (branch_id, e))
            });
        }

        let mut outcomes = Vec::with_capacity(spec.branches.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    let is_success = outcome.result.is_success();
                    outcomes.push(outcome);
                    // ANY is satisfied by the first successful branch; the
                    // remaining in-flight branches are cancelled rather
                    // than awaited out (§4.2 Parallel, ANY consensus).
                    if kind == ConsensusKind::Any && is_success {
                        set.abort_all();
                        break;
                    }
                }
                Ok(Err((branch_id, e))) => outcomes.push(BranchOutcome {
                    branch_id,
                    result: NodeResult::failure(e.to_string()),
                    rubric_score: None,
                }),
                Err(e) => outcomes.push(BranchOutcome {
                    branch_id: "unknown".to_string(),
                    result: NodeResult::failure(format!("branch task panicked: {e}")),
                    rubric_score: None,
                }),
            }
        }

        let succeeded = outcomes.iter().filter(|o| o.result.is_success()).count();
        let total = outcomes.len().max(1);

        let consensus_met = match kind {
            ConsensusKind::All => succeeded == outcomes.len(),
            // §4.2 Parallel, MAJORITY: agreement on normalized output,
            // not just independent per-branch success — the largest
            // group of successful branches whose outputs normalize to
            // the same string must meet ⌈n/2⌉+1.
            ConsensusKind::Majority => {
                largest_agreeing_group(&outcomes) >= majority_threshold(outcomes.len())
            }
            ConsensusKind::Any => succeeded > 0,
        };

        let mut branch_outputs = serde_json::Map::new();
        for outcome in &outcomes {
            branch_outputs.insert(
                outcome.branch_id.clone(),
                serde_json::json!({
                    "success": outcome.result.is_success(),
                    "output": outcome.result.output,
                    "score": outcome.rubric_score,
                }),
            );
        }

        let mut metadata = HashMap::new();
        metadata.insert("branches".to_string(), Value::Object(branch_outputs));

        if consensus_met {
            let combined = outcomes
                .iter()
                .filter_map(|o| o.result.output.clone())
                .collect::<Vec<_>>()
                .join("\n---\n");
            Ok(NodeResult::success(combined, metadata))
        } else {
            let mut result = NodeResult::failure(format!(
                "consensus not met: {succeeded}/{total} branches succeeded"
            ));
            result.metadata.extend(metadata);
            Ok(result)
        }
    }
}

/// `⌈n/2⌉+1` per §4.2's MAJORITY consensus rule.
fn majority_threshold(n: usize) -> usize {
    (n + 1) / 2 + 1
}

/// Normalize a branch's output for agreement comparison: trimmed and
/// lowercased, so whitespace/casing differences don't split otherwise
/// identical answers into separate groups.
fn normalize_output(output: &Option<String>) -> String {
    output.as_deref().unwrap_or("").trim().to_lowercase()
}

/// Size of the largest group of successful branches whose outputs
/// normalize to the same string.
fn largest_agreeing_group(outcomes: &[BranchOutcome]) -> usize {
    let mut groups: HashMap<String, usize> = HashMap::new();
    for outcome in outcomes {
        if outcome.result.is_success() {
            *groups.entry(normalize_output(&outcome.result.output)).or_insert(0) += 1;
        }
    }
    groups.values().copied().max().unwrap_or(0)
}

async fn run_branch(
    branch: Branch,
    agent: std::sync::Arc<dyn crate::agent::Agent>,
    prompt: String,
    context: HashMap<String, Value>,
    rubrics: std::sync::Arc<crate::rubric::RubricEngine>,
) -> Result<BranchOutcome> {
    let response = agent.execute(&prompt, &context).await;
    let result = match response {
        Ok(AgentResponse::Text(text)) => NodeResult::success(text.content, HashMap::new()),
        Ok(AgentResponse::Error(message)) => NodeResult::failure(message),
        Ok(_) => NodeResult::failure("branch agent returned an unsupported response type"),
        Err(e) => NodeResult::failure(e.to_string()),
    };

    let rubric_score = if let Some(rubric_id) = &branch.rubric_id {
        rubrics
            .evaluate(rubric_id, &result, None)
            .await
            .ok()
            .map(|(eval, _)| eval.score)
    } else {
        None
    };

    Ok(BranchOutcome {
        branch_id: branch.id.clone(),
        result,
        rubric_score,
    })
}
