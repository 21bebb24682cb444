//! Post-execution processor pipeline (C4): output extraction, history,
//! review, rubric, transition — applied in that order after every node
//! executes (§4.4-§4.8).

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::review::{ReviewDecision, ReviewHandler};

use crate::rubric::RubricEngine;
use crate::state::{BacktrackRecord, ExecutionStep, HensuState, NodeResult};
use crate::validator::AgentOutputValidator;
use crate::workflow::model::{ExitStatus, Node, NodeVariant, Workflow};
use crate::workflow::transitions::{failure_rule_should_retry, select_transition};
use crate::{HensuError, Result};

/// Score bands driving automatic backtrack on a rubric failure (§4.6).
#[derive(Debug, Clone, Copy)]
pub struct AutoBacktrackThresholds {
    /// Scores below this are a critical failure: backtrack immediately.
    pub critical_max: f64,
    /// Scores in `[critical_max, moderate_max)` are a moderate failure:
    /// same treatment as critical, backtrack immediately.
    pub moderate_max: f64,
    /// Scores in `[moderate_max, minor_max)` are a minor failure: increment
    /// `context["retry_attempt"]` and retry the current node until it hits
    /// `max_retries`, then fall through to ordinary transition rules.
    pub minor_max: f64,
    pub max_retries: u32,
}

impl Default for AutoBacktrackThresholds {
    fn default() -> Self {
        Self {
            critical_max: 30.0,
            moderate_max: 60.0,
            minor_max: 80.0,
            max_retries: 3,
        }
    }
}

/// Outcome of running one node's result through the pipeline.
pub enum PipelineOutcome {
    Advance { target: String },
    Retry,
    Backtrack { target: String },
    Paused { reason: String },
    Rejected { reason: String },
    Complete { exit_status: ExitStatus },
}

pub struct ProcessorPipeline {
    rubrics: Arc<RubricEngine>,
    review_handler: Arc<dyn ReviewHandler>,
    validator: AgentOutputValidator,
    thresholds: AutoBacktrackThresholds,
}

impl ProcessorPipeline {
    pub fn new(
        rubrics: Arc<RubricEngine>,
        review_handler: Arc<dyn ReviewHandler>,
        thresholds: AutoBacktrackThresholds,
    ) -> Self {
        Self {
            rubrics,
            review_handler,
            validator: AgentOutputValidator,
            thresholds,
        }
    }

    pub async fn process(
        &self,
        node: &Node,
        workflow: &Workflow,
        state: &mut HensuState,
        mut result: NodeResult,
    ) -> Result<PipelineOutcome> {
        self.extract_output(node, &mut result, state)?;

        state.history.push(ExecutionStep {
            node_id: node.id.clone(),
            result: result.clone(),
            timestamp: Utc::now(),
            context_snapshot: state.context.clone(),
            backtrack: None,
        });

        if let NodeVariant::Standard(spec) = &node.variant {
            if spec.planning_mode == crate::workflow::model::PlanningMode::Enabled
                && node.review.review_plan
                && state.active_plan.is_some()
            {
                return Ok(PipelineOutcome::Paused {
                    reason: "plan awaiting review".to_string(),
                });
            }
        }

        if let Some(decision) = self.run_review(node, state, !result.is_success()).await? {
            match decision {
                ReviewDecision::Approve { edited_state } => {
                    if let Some(edits) = edited_state {
                        state.context.extend(edits);
                    }
                }
                ReviewDecision::Backtrack {
                    target_step,
                    edited_state,
                    reason,
                    edited_prompt,
                } => {
                    if !node.review.allow_backtrack {
                        return Err(HensuError::ReviewBacktrackInvalid(format!(
                            "node {} does not allow reviewer backtracks",
                            node.id
                        )));
                    }
                    if !workflow.nodes.contains_key(&target_step) {
                        return Err(HensuError::ReviewBacktrackInvalid(format!(
                            "unknown backtrack target '{target_step}'"
                        )));
                    }
                    if let Some(edits) = edited_state {
                        state.context.extend(edits);
                    }
                    if let Some(prompt) = edited_prompt {
                        state
                            .context
                            .insert("_review_edited_prompt".to_string(), serde_json::json!(prompt));
                    }
                    self.record_backtrack(state, &node.id, &target_step, &reason);
                    return Ok(PipelineOutcome::Backtrack { target: target_step });
                }
                ReviewDecision::Reject { reason } => {
                    return Ok(PipelineOutcome::Rejected { reason });
                }
            }
        }

        let rubric_eval = if let Some(rubric_id) = node.rubric_id() {
            let (eval, recommendations) = self
                .rubrics
                .evaluate(rubric_id, &result, extract_preset_score(state))
                .await?;
            for rec in &recommendations {
                debug!(node_id = %node.id, recommendation = %rec, "rubric recommendation");
            }
            state.rubric_evaluation = Some(eval.clone());

            if let Some(outcome) = self.apply_auto_backtrack(node, workflow, state, &eval) {
                return Ok(outcome);
            }
            Some(eval)
        } else {
            None
        };

        if node.is_end() {
            let exit_status = match &node.variant {
                NodeVariant::End(e) => e.exit_status,
                _ => unreachable!(),
            };
            return Ok(PipelineOutcome::Complete { exit_status });
        }

        if let Some(target) = state.loop_break_target.take() {
            return Ok(PipelineOutcome::Advance { target });
        }

        if let Some(target) = result.metadata.get("target_override").and_then(|v| v.as_str()) {
            return Ok(PipelineOutcome::Advance {
                target: target.to_string(),
            });
        }

        match select_transition(&node.transition_rules, state, &result, rubric_eval.as_ref()) {
            Some(target) => Ok(PipelineOutcome::Advance { target }),
            None => {
                if !result.is_success() {
                    let should_retry = node
                        .transition_rules
                        .iter()
                        .any(|r| failure_rule_should_retry(r, state));
                    if should_retry {
                        state.retry_count += 1;
                        return Ok(PipelineOutcome::Retry);
                    }
                }
                Err(HensuError::NoMatchingTransition(node.id.clone()))
            }
        }
    }

    fn extract_output(&self, node: &Node, result: &mut NodeResult, state: &mut HensuState) -> Result<()> {
        let Some(output) = &result.output else {
            return Ok(());
        };
        self.validator.validate(output)?;

        state
            .context
            .insert(format!("{}_output", node.id), serde_json::Value::String(output.clone()));

        let output_params = match &node.variant {
            NodeVariant::Standard(s) => s.output_params.as_deref(),
            _ => None,
        };
        let Some(keys) = output_params else {
            return Ok(());
        };

        if let Some(obj) = crate::rubric::first_json_object(output) {
            for key in keys {
                if let Some(value) = obj.get(key) {
                    state.context.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn run_review(
        &self,
        node: &Node,
        state: &HensuState,
        result_failed: bool,
    ) -> Result<Option<ReviewDecision>> {
        if !node.review.triggers(result_failed) {
            return Ok(None);
        }
        let decision = self
            .review_handler
            .request_review(state.execution_id, &node.id, &node.review)
            .await?;
        Ok(Some(decision))
    }

    fn record_backtrack(&self, state: &mut HensuState, from: &str, to: &str, reason: &str) {
        state.history.push(ExecutionStep {
            node_id: from.to_string(),
            result: NodeResult::failure(reason.to_string()),
            timestamp: Utc::now(),
            context_snapshot: state.context.clone(),
            backtrack: Some(BacktrackRecord {
                from_node_id: from.to_string(),
                to_node_id: to.to_string(),
                reason: reason.to_string(),
                at: Utc::now(),
            }),
        });
        state.set_current_node(to.to_string());
    }

    /// Apply the auto-backtrack ladder (§4.6): critical and moderate scores
    /// both force an immediate backtrack to the most recent prior node that
    /// carries a rubric (falling back to retrying the current node if no
    /// such node exists in history), minor scores increment a
    /// `retry_attempt` counter in context and retry the current node up to
    /// `max_retries` before falling through to ordinary transition rules.
    fn apply_auto_backtrack(
        &self,
        node: &Node,
        workflow: &Workflow,
        state: &mut HensuState,
        eval: &crate::rubric::RubricEvaluation,
    ) -> Option<PipelineOutcome> {
        if eval.passed || eval.score >= self.thresholds.minor_max {
            return None;
        }

        if eval.score < self.thresholds.moderate_max {
            let before_index = state.history.len().saturating_sub(1);
            let has_rubric = |id: &str| workflow.node(id).and_then(|n| n.rubric_id()).is_some();
            let Some(target) = state
                .history
                .most_recent_rubric_node(before_index, has_rubric)
                .map(|s| s.to_string())
            else {
                if state.retry_count >= self.thresholds.max_retries {
                    return None;
                }
                info!(node_id = %node.id, score = eval.score, "auto-backtrack: no prior rubric node, retrying");
                state.retry_count += 1;
                return Some(PipelineOutcome::Retry);
            };
            let reason = format!("rubric failure (score {:.1})", eval.score);
            warn!(node_id = %node.id, score = eval.score, target = %target, "auto-backtrack: critical/moderate");
            self.record_backtrack(state, &node.id, &target, &reason);
            return Some(PipelineOutcome::Backtrack { target });
        }

        let attempt = state
            .context
            .get("retry_attempt")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if attempt < self.thresholds.max_retries as u64 {
            state
                .context
                .insert("retry_attempt".to_string(), serde_json::json!(attempt + 1));
            info!(node_id = %node.id, score = eval.score, attempt = attempt + 1, "auto-backtrack: minor retry");
            return Some(PipelineOutcome::Retry);
        }

        None
    }
}

fn extract_preset_score(state: &HensuState) -> Option<f64> {
    state
        .context
        .get("score")
        .and_then(|v| v.as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::AutoApproveReviewHandler;
    use crate::rubric::{Criterion, EvaluationType, Rubric};
    use crate::workflow::model::{
        AgentConfig, EndNode, ExitStatus, NodeVariant, PlanningMode, StandardNode, TransitionRule,
        Workflow, WorkflowConfig, WorkflowMetadata,
    };
    use std::collections::HashMap;

    fn standard_node(id: &str, rubric_id: Option<&str>, rules: Vec<TransitionRule>) -> Node {
        Node {
            id: id.to_string(),
            variant: NodeVariant::Standard(StandardNode {
                agent_id: "writer".into(),
                prompt: "do it".into(),
                output_params: None,
                plan_failure_target: None,
                planning_mode: PlanningMode::Disabled,
                max_plan_steps: None,
                max_plan_replans: None,
                timeout_seconds: None,
            }),
            transition_rules: rules,
            rubric_id: rubric_id.map(str::to_string),
            review: crate::review::ReviewConfig::default(),
        }
    }

    fn end_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            variant: NodeVariant::End(EndNode { exit_status: ExitStatus::Success }),
            transition_rules: vec![],
            rubric_id: None,
            review: crate::review::ReviewConfig::default(),
        }
    }

    fn workflow_with(nodes: Vec<Node>, rubrics: HashMap<String, String>) -> Workflow {
        let mut node_map = HashMap::new();
        for n in nodes {
            node_map.insert(n.id.clone(), n);
        }
        Workflow {
            id: "wf".into(),
            version: "1.0.0".into(),
            start_node_id: "a".into(),
            agents: HashMap::from([(
                "writer".to_string(),
                AgentConfig {
                    model: "stub".into(),
                    role: "writer".into(),
                    temperature: 0.0,
                    max_tokens: 100,
                    tool_ids: vec![],
                    instructions: None,
                    provider_hint: None,
                },
            )]),
            rubrics,
            nodes: node_map,
            metadata: WorkflowMetadata::default(),
            config: WorkflowConfig::default(),
        }
    }

    fn pipeline(thresholds: AutoBacktrackThresholds) -> ProcessorPipeline {
        ProcessorPipeline::new(
            Arc::new(RubricEngine::new(HashMap::new())),
            Arc::new(AutoApproveReviewHandler),
            thresholds,
        )
    }

    #[tokio::test]
    async fn success_result_advances_on_success_rule() {
        let node = standard_node(
            "a",
            None,
            vec![TransitionRule::Success { target: "b".into() }],
        );
        let wf = workflow_with(vec![node.clone(), end_node("b")], HashMap::new());
        let mut state = HensuState::new("wf", "a", HashMap::new());
        let p = pipeline(AutoBacktrackThresholds::default());

        let outcome = p
            .process(&node, &wf, &mut state, NodeResult::success("done", HashMap::new()))
            .await
            .unwrap();
        match outcome {
            PipelineOutcome::Advance { target } => assert_eq!(target, "b"),
            _ => panic!("expected advance"),
        }
        assert_eq!(state.history.len(), 1);
    }

    #[tokio::test]
    async fn failure_without_retry_rule_errors() {
        let node = standard_node("a", None, vec![TransitionRule::Success { target: "b".into() }]);
        let wf = workflow_with(vec![node.clone(), end_node("b")], HashMap::new());
        let mut state = HensuState::new("wf", "a", HashMap::new());
        let p = pipeline(AutoBacktrackThresholds::default());

        let err = p
            .process(&node, &wf, &mut state, NodeResult::failure("bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, HensuError::NoMatchingTransition(_)));
    }

    #[tokio::test]
    async fn end_node_completes_without_transition_rules() {
        let node = end_node("b");
        let wf = workflow_with(vec![standard_node("a", None, vec![]), node.clone()], HashMap::new());
        let mut state = HensuState::new("wf", "b", HashMap::new());
        let p = pipeline(AutoBacktrackThresholds::default());

        let outcome = p
            .process(&node, &wf, &mut state, NodeResult::success("done", HashMap::new()))
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Complete { exit_status: ExitStatus::Success }));
    }

    #[tokio::test]
    async fn target_override_short_circuits_transition_rules() {
        let node = standard_node("a", None, vec![TransitionRule::Success { target: "b".into() }]);
        let wf = workflow_with(vec![node.clone(), end_node("b"), end_node("fallback")], HashMap::new());
        let mut state = HensuState::new("wf", "a", HashMap::new());
        let p = pipeline(AutoBacktrackThresholds::default());

        let mut metadata = HashMap::new();
        metadata.insert("target_override".to_string(), serde_json::json!("fallback"));
        let result = NodeResult {
            status: crate::state::NodeStatus::Failure,
            output: None,
            metadata,
        };

        let outcome = p.process(&node, &wf, &mut state, result).await.unwrap();
        match outcome {
            PipelineOutcome::Advance { target } => assert_eq!(target, "fallback"),
            _ => panic!("expected advance via override"),
        }
    }

    fn pipeline_with_rubric(
        thresholds: AutoBacktrackThresholds,
        pass_threshold: f64,
    ) -> ProcessorPipeline {
        let rubric = Rubric {
            id: "r1".into(),
            name: "Quality".into(),
            pass_threshold,
            criteria: vec![Criterion {
                id: "c1".into(),
                name: "Correctness".into(),
                weight: 1.0,
                min_score: 0.0,
                evaluation_type: EvaluationType::Automated,
                evaluation_logic: String::new(),
                description: String::new(),
            }],
        };
        ProcessorPipeline::new(
            Arc::new(RubricEngine::new(HashMap::from([("r1".to_string(), rubric)]))),
            Arc::new(AutoApproveReviewHandler),
            thresholds,
        )
    }

    fn scored_result(score: i32) -> NodeResult {
        NodeResult::success(format!("{{\"score\": {score}}}"), HashMap::new())
    }

    /// Spec §8.4: node B (rubric score 45) preceded by node A (has a
    /// rubric). Moderate failures backtrack exactly like critical ones.
    #[tokio::test]
    async fn moderate_rubric_failure_backtracks_to_prior_rubric_node() {
        let node_a = standard_node("a", Some("r1"), vec![TransitionRule::Success { target: "b".into() }]);
        let node_b = standard_node("b", Some("r1"), vec![TransitionRule::Success { target: "end".into() }]);
        let wf = workflow_with(
            vec![node_a.clone(), node_b.clone(), end_node("end")],
            HashMap::from([("r1".to_string(), "r1".to_string())]),
        );
        let mut state = HensuState::new("wf", "b", HashMap::new());
        state.history.push(ExecutionStep {
            node_id: "a".to_string(),
            result: scored_result(90),
            timestamp: Utc::now(),
            context_snapshot: HashMap::new(),
            backtrack: None,
        });

        let p = pipeline_with_rubric(AutoBacktrackThresholds::default(), 80.0);
        let outcome = p
            .process(&node_b, &wf, &mut state, scored_result(45))
            .await
            .unwrap();

        match outcome {
            PipelineOutcome::Backtrack { target } => assert_eq!(target, "a"),
            _ => panic!("expected backtrack"),
        }
        assert_eq!(state.current_node_id, "a");
        assert_eq!(
            state.history.steps.iter().filter(|s| s.backtrack.is_some()).count(),
            1
        );
    }

    /// Backtrack target must be the nearest prior node that itself carries
    /// a rubric, skipping over non-rubric nodes in between.
    #[tokio::test]
    async fn moderate_rubric_failure_skips_non_rubric_nodes_to_find_target() {
        let node_a = standard_node("a", Some("r1"), vec![]);
        let node_x = standard_node("x", None, vec![]);
        let node_b = standard_node("b", Some("r1"), vec![TransitionRule::Success { target: "end".into() }]);
        let wf = workflow_with(
            vec![node_a, node_x, node_b.clone(), end_node("end")],
            HashMap::from([("r1".to_string(), "r1".to_string())]),
        );
        let mut state = HensuState::new("wf", "b", HashMap::new());
        for id in ["a", "x"] {
            state.history.push(ExecutionStep {
                node_id: id.to_string(),
                result: scored_result(90),
                timestamp: Utc::now(),
                context_snapshot: HashMap::new(),
                backtrack: None,
            });
        }

        let p = pipeline_with_rubric(AutoBacktrackThresholds::default(), 80.0);
        let outcome = p
            .process(&node_b, &wf, &mut state, scored_result(45))
            .await
            .unwrap();

        match outcome {
            PipelineOutcome::Backtrack { target } => assert_eq!(target, "a"),
            _ => panic!("expected backtrack to nearest rubric node, not 'x'"),
        }
    }

    /// Spec §4.3 step 4, minor band: increment `retry_attempt` and keep
    /// retrying the current node until `max_retries`, then fall through.
    #[tokio::test]
    async fn minor_rubric_failure_retries_then_falls_through_to_transitions() {
        let node = standard_node("b", Some("r1"), vec![TransitionRule::Success { target: "end".into() }]);
        let wf = workflow_with(
            vec![node.clone(), end_node("end")],
            HashMap::from([("r1".to_string(), "r1".to_string())]),
        );
        let mut state = HensuState::new("wf", "b", HashMap::new());
        let thresholds = AutoBacktrackThresholds {
            max_retries: 2,
            ..AutoBacktrackThresholds::default()
        };
        let p = pipeline_with_rubric(thresholds, 90.0);

        let outcome = p
            .process(&node, &wf, &mut state, scored_result(70))
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Retry));
        assert_eq!(state.context.get("retry_attempt").and_then(|v| v.as_u64()), Some(1));

        let outcome = p
            .process(&node, &wf, &mut state, scored_result(70))
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Retry));
        assert_eq!(state.context.get("retry_attempt").and_then(|v| v.as_u64()), Some(2));

        let outcome = p
            .process(&node, &wf, &mut state, scored_result(70))
            .await
            .unwrap();
        match outcome {
            PipelineOutcome::Advance { target } => assert_eq!(target, "end"),
            _ => panic!("expected fall-through to transition rules once max_retries is hit"),
        }
    }
}
