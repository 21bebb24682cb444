//! Rubric engine: weighted-criteria scoring with LLM and heuristic
//! evaluators (C6).

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::Agent;
use crate::state::NodeResult;
use crate::{HensuError, Result};

/// How a single criterion is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationType {
    Automated,
    LlmBased,
}

/// A single weighted scoring dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub name: String,
    /// Weight in `[0, 1]`.
    pub weight: f64,
    pub min_score: f64,
    pub evaluation_type: EvaluationType,
    /// Free-form evaluation guidance. For the fallback heuristic this may
    /// double as a whitespace-separated keyword list (§4.6).
    pub evaluation_logic: String,
    pub description: String,
}

/// A rubric: id, name, pass threshold, and its criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rubric {
    pub id: String,
    pub name: String,
    pub pass_threshold: f64,
    pub criteria: Vec<Criterion>,
}

/// Per-criterion scoring detail attached to a `RubricEvaluation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion_id: String,
    pub score: f64,
    pub passed_min: bool,
}

/// Result of evaluating one rubric against one `NodeResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricEvaluation {
    pub rubric_id: String,
    pub score: f64,
    pub passed: bool,
    pub criteria: Vec<CriterionResult>,
}

/// Mutable evaluation context threaded through criterion scoring, used
/// to accumulate reviewer-facing recommendations (§4.6).
#[derive(Debug, Default)]
pub struct EvaluationContext {
    pub recommendations: Vec<String>,
    /// Pre-supplied score short-circuit, mirroring `ctx["score"]`.
    pub preset_score: Option<f64>,
}

static FIRST_JSON_OBJECT: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"\{[^{}]*\}").unwrap());

/// Extract the first JSON object substring from free-form text. Per the
/// open question in the spec, "first JSON block wins" is preserved
/// deliberately — do not switch to last-wins.
pub(crate) fn first_json_object(text: &str) -> Option<Value> {
    // Try a proper brace-balance scan first so nested objects parse
    // correctly; the precompiled regex above is a fast reject for text
    // with no braces at all.
    if !FIRST_JSON_OBJECT.is_match(text) {
        return None;
    }
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;
    let mut depth = 0usize;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str::<Value>(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn extract_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Parse a self-reported score out of agent prose using the accepted
/// textual forms (`"score": N`, `score = N`, `score: N.N`).
fn parse_loose_score(text: &str) -> Option<f64> {
    static LOOSE_SCORE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r#"(?i)"?score"?\s*[:=]\s*(-?\d+(?:\.\d+)?)"#).unwrap()
    });
    LOOSE_SCORE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// Keyword-based fallback heuristic used when no JSON self-report or LLM
/// evaluator is available (§4.6).
fn keyword_heuristic(output: &str, evaluation_logic: &str) -> f64 {
    let lower = output.to_lowercase();
    let mut score = if lower.contains("excellent") {
        95.0
    } else if lower.contains("good") {
        80.0
    } else if lower.contains("poor") {
        35.0
    } else {
        50.0
    };

    let keywords: Vec<&str> = evaluation_logic.split_whitespace().collect();
    if !keywords.is_empty() {
        let hits = keywords
            .iter()
            .filter(|kw| lower.contains(&kw.to_lowercase()))
            .count();
        // Each matched keyword nudges the score up, capped at 100.
        let bonus = (hits as f64 / keywords.len() as f64) * (100.0 - score);
        score += bonus;
    }
    clamp_score(score)
}

/// Build the prompt sent to an LLM-based evaluator for one criterion.
fn build_evaluation_prompt(criterion: &Criterion, content: &str) -> String {
    format!(
        "Evaluate the following content against this criterion.\n\n\
         Criterion: {}\n\
         Description: {}\n\
         Evaluation guidance: {}\n\n\
         Content:\n{}\n\n\
         Respond with a JSON object containing a \"score\" field from 0 to 100.",
        criterion.name, criterion.description, criterion.evaluation_logic, content
    )
}

/// Engine that evaluates rubrics against node results, optionally using
/// a registered LLM evaluator agent per criterion.
pub struct RubricEngine {
    rubrics: HashMap<String, Rubric>,
    evaluator: Option<Arc<dyn Agent>>,
}

impl RubricEngine {
    pub fn new(rubrics: HashMap<String, Rubric>) -> Self {
        Self {
            rubrics,
            evaluator: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Agent>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn rubric(&self, id: &str) -> Option<&Rubric> {
        self.rubrics.get(id)
    }

    /// Evaluate one criterion against a node result, following the
    /// fail-fast / context-short-circuit / JSON self-report / LLM /
    /// heuristic ladder described in §4.6.
    pub async fn evaluate_criterion(
        &self,
        criterion: &Criterion,
        result: &NodeResult,
        ctx: &mut EvaluationContext,
    ) -> f64 {
        if !result.is_success() || result.output.as_deref().unwrap_or("").trim().is_empty() {
            ctx.recommendations.push("execution failed".to_string());
            return 0.0;
        }

        if let Some(score) = ctx.preset_score {
            return clamp_score(score);
        }

        let output = result.output.as_deref().unwrap_or_default();

        if let Some(obj) = first_json_object(output) {
            if let Some(score_value) = obj.get("score") {
                if let Some(score) = extract_number(score_value) {
                    let score = clamp_score(score);
                    if score < criterion.min_score {
                        if let Some(rec) = obj.get("recommendation").and_then(|v| v.as_str()) {
                            if !rec.trim().is_empty() {
                                ctx.recommendations.push(rec.to_string());
                            }
                        }
                    }
                    return score;
                }
            }
        }

        if criterion.evaluation_type == EvaluationType::LlmBased {
            if let Some(evaluator) = &self.evaluator {
                let prompt = build_evaluation_prompt(criterion, output);
                match evaluator.execute(&prompt, &HashMap::new()).await {
                    Ok(crate::agent::AgentResponse::Text(resp)) => {
                        if let Some(score) = first_json_object(&resp.content)
                            .and_then(|o| o.get("score").and_then(extract_number))
                            .or_else(|| parse_loose_score(&resp.content))
                        {
                            return clamp_score(score);
                        }
                        return clamp_score(keyword_heuristic(&resp.content, &criterion.evaluation_logic));
                    }
                    _ => return 50.0,
                }
            }
        }

        clamp_score(keyword_heuristic(output, &criterion.evaluation_logic))
    }

    /// Evaluate a rubric in full: weighted average of criterion scores,
    /// passed iff the weighted score clears `pass_threshold` and every
    /// criterion clears its own `min_score`.
    pub async fn evaluate(
        &self,
        rubric_id: &str,
        result: &NodeResult,
        preset_score: Option<f64>,
    ) -> Result<(RubricEvaluation, Vec<String>)> {
        let rubric = self
            .rubrics
            .get(rubric_id)
            .ok_or_else(|| HensuError::RubricNotFound(rubric_id.to_string()))?;

        let mut ctx = EvaluationContext {
            preset_score,
            ..Default::default()
        };

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut details = Vec::with_capacity(rubric.criteria.len());
        let mut all_min_passed = true;

        for criterion in &rubric.criteria {
            let score = self.evaluate_criterion(criterion, result, &mut ctx).await;
            let passed_min = score >= criterion.min_score;
            all_min_passed &= passed_min;

            weighted_sum += score * criterion.weight;
            weight_total += criterion.weight;

            details.push(CriterionResult {
                criterion_id: criterion.id.clone(),
                score,
                passed_min,
            });
        }

        let composite = if weight_total > 0.0 {
            weighted_sum / weight_total
        } else {
            0.0
        };

        let passed = composite >= rubric.pass_threshold && all_min_passed;

        Ok((
            RubricEvaluation {
                rubric_id: rubric_id.to_string(),
                score: composite,
                passed,
                criteria: details,
            },
            ctx.recommendations,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criterion(weight: f64, min_score: f64) -> Criterion {
        Criterion {
            id: "c1".into(),
            name: "Correctness".into(),
            weight,
            min_score,
            evaluation_type: EvaluationType::Automated,
            evaluation_logic: "thorough accurate".into(),
            description: "Is the output correct?".into(),
        }
    }

    fn rubric(criteria: Vec<Criterion>, threshold: f64) -> Rubric {
        Rubric {
            id: "r1".into(),
            name: "Quality".into(),
            pass_threshold: threshold,
            criteria,
        }
    }

    #[tokio::test]
    async fn fail_fast_on_failed_result() {
        let engine = RubricEngine::new(HashMap::from([("r1".into(), rubric(vec![criterion(1.0, 50.0)], 50.0))]));
        let result = NodeResult::failure("boom");
        let (eval, recs) = engine.evaluate("r1", &result, None).await.unwrap();
        assert_eq!(eval.score, 0.0);
        assert!(!eval.passed);
        assert!(recs.iter().any(|r| r.contains("execution failed")));
    }

    #[tokio::test]
    async fn json_self_report_extracts_score() {
        let engine = RubricEngine::new(HashMap::from([("r1".into(), rubric(vec![criterion(1.0, 50.0)], 50.0))]));
        let result = NodeResult::success(r#"Looks good. {"score": 92, "notes": "n/a"}"#, HashMap::new());
        let (eval, _) = engine.evaluate("r1", &result, None).await.unwrap();
        assert_eq!(eval.score, 92.0);
        assert!(eval.passed);
    }

    #[tokio::test]
    async fn json_self_report_first_block_wins() {
        let engine = RubricEngine::new(HashMap::from([("r1".into(), rubric(vec![criterion(1.0, 0.0)], 50.0))]));
        let result = NodeResult::success(
            r#"{"score": 40} later revised to {"score": 95}"#,
            HashMap::new(),
        );
        let (eval, _) = engine.evaluate("r1", &result, None).await.unwrap();
        assert_eq!(eval.score, 40.0);
    }

    #[tokio::test]
    async fn below_min_score_appends_recommendation() {
        let engine = RubricEngine::new(HashMap::from([("r1".into(), rubric(vec![criterion(1.0, 80.0)], 50.0))]));
        let result = NodeResult::success(
            r#"{"score": 40, "recommendation": "add more tests"}"#,
            HashMap::new(),
        );
        let (eval, recs) = engine.evaluate("r1", &result, None).await.unwrap();
        assert!(!eval.criteria[0].passed_min);
        assert!(recs.iter().any(|r| r.contains("add more tests")));
    }

    #[tokio::test]
    async fn preset_context_score_short_circuits() {
        let engine = RubricEngine::new(HashMap::from([("r1".into(), rubric(vec![criterion(1.0, 0.0)], 50.0))]));
        let result = NodeResult::success("no json here", HashMap::new());
        let (eval, _) = engine.evaluate("r1", &result, Some(77.0)).await.unwrap();
        assert_eq!(eval.score, 77.0);
    }

    #[tokio::test]
    async fn keyword_fallback_heuristic() {
        let engine = RubricEngine::new(HashMap::from([("r1".into(), rubric(vec![criterion(1.0, 0.0)], 10.0))]));
        let result = NodeResult::success("This is an excellent solution.", HashMap::new());
        let (eval, _) = engine.evaluate("r1", &result, None).await.unwrap();
        assert!(eval.score >= 90.0);
    }

    #[tokio::test]
    async fn weighted_average_across_criteria() {
        let criteria = vec![
            Criterion {
                weight: 0.25,
                ..criterion(0.25, 0.0)
            },
            Criterion {
                id: "c2".into(),
                weight: 0.75,
                ..criterion(0.75, 0.0)
            },
        ];
        let engine = RubricEngine::new(HashMap::from([("r1".into(), rubric(criteria, 50.0))]));
        let result = NodeResult::success(r#"{"score": 100}"#, HashMap::new());
        let (eval, _) = engine.evaluate("r1", &result, None).await.unwrap();
        assert_eq!(eval.score, 100.0);
    }

    #[tokio::test]
    async fn rubric_not_found_errors() {
        let engine = RubricEngine::new(HashMap::new());
        let result = NodeResult::success("ok", HashMap::new());
        let err = engine.evaluate("missing", &result, None).await.unwrap_err();
        assert!(matches!(err, HensuError::RubricNotFound(_)));
    }

    #[test]
    fn first_json_object_handles_nested_braces() {
        let text = r#"intro {"score": 10, "meta": {"nested": true}} trailing"#;
        let obj = first_json_object(text).unwrap();
        assert_eq!(obj.get("score").and_then(|v| v.as_i64()), Some(10));
    }
}
