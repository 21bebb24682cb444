//! Transition rule evaluation (C5).
//!
//! Three invariants (§4.4): evaluation order matches definition order,
//! rules are pure (read state + result, return an optional target), and
//! score extraction prefers the rubric evaluation on state, falling back
//! to context score keys only for nodes without a rubric.

use crate::rubric::RubricEvaluation;
use crate::state::{HensuState, NodeResult};
use crate::workflow::model::TransitionRule;

/// Context-level fallback keys checked, in order, when no rubric
/// evaluation is present on state (§3 TransitionRule.Score).
const SCORE_CONTEXT_KEYS: [&str; 4] = ["score", "final_score", "quality_score", "evaluation_score"];

/// Extract a numeric score for `Score` transition evaluation.
///
/// Deterministic: identical `(state, result)` always yields the same
/// extracted value (§8 testable property).
pub fn extract_score(state: &HensuState) -> Option<f64> {
    if let Some(eval) = &state.rubric_evaluation {
        return Some(eval.score);
    }
    for key in SCORE_CONTEXT_KEYS {
        if let Some(value) = state.context.get(key) {
            if let Some(n) = value.as_f64() {
                return Some(n);
            }
            if let Some(s) = value.as_str() {
                if let Ok(n) = s.parse::<f64>() {
                    return Some(n);
                }
            }
        }
    }
    None
}

/// Evaluate a single transition rule against the current state/result.
/// Returns `Some(target_node_id)` iff this rule fires.
pub fn evaluate_rule(
    rule: &TransitionRule,
    state: &HensuState,
    result: &NodeResult,
    rubric_eval: Option<&RubricEvaluation>,
) -> Option<String> {
    match rule {
        TransitionRule::Success { target } => result.is_success().then(|| target.clone()),
        TransitionRule::Failure { retry_count, .. } if !result.is_success() => {
            // Retry handling (incrementing state.retry_count) is the
            // caller's responsibility — see `workflow::pipeline`. Here we
            // only decide whether the retry budget is exhausted.
            if state.retry_count < *retry_count {
                None
            } else if let TransitionRule::Failure { target, .. } = rule {
                Some(target.clone())
            } else {
                unreachable!()
            }
        }
        TransitionRule::Failure { .. } => None,
        TransitionRule::Always { target } => Some(target.clone()),
        TransitionRule::Score { conditions } => {
            let score = rubric_eval
                .map(|e| e.score)
                .or_else(|| extract_score(state))?;
            conditions
                .iter()
                .find(|c| c.matches(score))
                .map(|c| c.target.clone())
        }
        TransitionRule::RubricFail { target } => {
            let eval = rubric_eval.or(state.rubric_evaluation.as_ref())?;
            (!eval.passed).then(|| target.clone())
        }
    }
}

/// Whether a `Failure` rule's retry budget for this pass is exhausted,
/// i.e. whether the pipeline should retry the current node instead of
/// taking the rule's target. Used by `TransitionPostProcessor`-adjacent
/// retry bookkeeping in the Standard executor's caller.
pub fn failure_rule_should_retry(rule: &TransitionRule, state: &HensuState) -> bool {
    matches!(rule, TransitionRule::Failure { retry_count, .. } if state.retry_count < *retry_count)
}

/// Evaluate the node's transition rules in order, returning the first
/// matching target.
pub fn select_transition(
    rules: &[TransitionRule],
    state: &HensuState,
    result: &NodeResult,
    rubric_eval: Option<&RubricEvaluation>,
) -> Option<String> {
    rules
        .iter()
        .find_map(|rule| evaluate_rule(rule, state, result, rubric_eval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{ScoreCondition, ScoreOp};
    use std::collections::HashMap;

    fn state() -> HensuState {
        HensuState::new("wf", "a", HashMap::new())
    }

    #[test]
    fn success_rule_fires_only_on_success() {
        let rule = TransitionRule::Success {
            target: "b".into(),
        };
        let ok = NodeResult::success("done", HashMap::new());
        let fail = NodeResult::failure("bad");
        assert_eq!(
            evaluate_rule(&rule, &state(), &ok, None),
            Some("b".to_string())
        );
        assert_eq!(evaluate_rule(&rule, &state(), &fail, None), None);
    }

    #[test]
    fn failure_rule_retries_then_targets() {
        let rule = TransitionRule::Failure {
            retry_count: 2,
            target: "fallback".into(),
        };
        let fail = NodeResult::failure("bad");

        let mut st = state();
        st.retry_count = 0;
        assert_eq!(evaluate_rule(&rule, &st, &fail, None), None);

        st.retry_count = 1;
        assert_eq!(evaluate_rule(&rule, &st, &fail, None), None);

        st.retry_count = 2;
        assert_eq!(
            evaluate_rule(&rule, &st, &fail, None),
            Some("fallback".to_string())
        );
    }

    #[test]
    fn score_rule_prefers_rubric_over_context() {
        use crate::rubric::RubricEvaluation;

        let mut st = state();
        st.context.insert("score".into(), serde_json::json!(10));
        let eval = RubricEvaluation {
            rubric_id: "r".into(),
            score: 85.0,
            passed: true,
            criteria: vec![],
        };

        let rule = TransitionRule::Score {
            conditions: vec![ScoreCondition {
                op: ScoreOp::Gte,
                value: Some(80.0),
                range: None,
                target: "approve".into(),
            }],
        };

        let result = NodeResult::success("ok", HashMap::new());
        assert_eq!(
            evaluate_rule(&rule, &st, &result, Some(&eval)),
            Some("approve".to_string())
        );
    }

    #[test]
    fn score_rule_falls_back_to_context_without_rubric() {
        let mut st = state();
        st.context.insert("final_score".into(), serde_json::json!(50));

        let rule = TransitionRule::Score {
            conditions: vec![ScoreCondition {
                op: ScoreOp::Lt,
                value: Some(60.0),
                range: None,
                target: "revise".into(),
            }],
        };

        let result = NodeResult::success("ok", HashMap::new());
        assert_eq!(
            evaluate_rule(&rule, &st, &result, None),
            Some("revise".to_string())
        );
    }

    #[test]
    fn select_transition_takes_first_match() {
        let rules = vec![
            TransitionRule::Failure {
                retry_count: 0,
                target: "retry_target".into(),
            },
            TransitionRule::Always {
                target: "always_target".into(),
            },
        ];
        let result = NodeResult::failure("bad");
        let target = select_transition(&rules, &state(), &result, None);
        assert_eq!(target, Some("retry_target".to_string()));
    }
}
