//! Human review checkpoints (§4.8, C8).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// When a node's review checkpoint engages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    /// Never automatically requested; only reachable if a caller pauses
    /// the execution out-of-band.
    Optional,
    /// Always requested after the node's result is produced.
    Required,
    /// Requested only when the node's result is a failure.
    OnFailure,
}

impl Default for ReviewMode {
    fn default() -> Self {
        ReviewMode::Optional
    }
}

/// What a node's review configuration targets and who resolves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub mode: ReviewMode,
    /// When true, a freshly created plan pauses for review before its
    /// first step runs rather than after the node's result is scored.
    pub review_plan: bool,
    pub allow_backtrack: bool,
    pub allow_edit_prompt: bool,
    pub reviewer_id: Option<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            mode: ReviewMode::Optional,
            review_plan: false,
            allow_backtrack: true,
            allow_edit_prompt: true,
            reviewer_id: None,
        }
    }
}

impl ReviewConfig {
    /// Whether this node's review should be requested for the given
    /// result, per §4.8's mode semantics.
    pub fn triggers(&self, result_failed: bool) -> bool {
        match self.mode {
            ReviewMode::Optional => false,
            ReviewMode::Required => true,
            ReviewMode::OnFailure => result_failed,
        }
    }
}

/// A human reviewer's verdict on a paused execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve {
        #[serde(skip_serializing_if = "Option::is_none")]
        edited_state: Option<HashMap<String, Value>>,
    },
    Backtrack {
        target_step: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        edited_state: Option<HashMap<String, Value>>,
        #[serde(default = "default_backtrack_reason")]
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        edited_prompt: Option<String>,
    },
    Reject {
        reason: String,
    },
}

fn default_backtrack_reason() -> String {
    "Manual backtrack by reviewer".to_string()
}

impl ReviewDecision {
    /// Construct a `Backtrack` decision, applying the spec-mandated
    /// default reason when the caller passes a blank one.
    pub fn backtrack(
        target_step: impl Into<String>,
        edited_state: Option<HashMap<String, Value>>,
        reason: impl Into<String>,
        edited_prompt: Option<String>,
    ) -> Self {
        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            default_backtrack_reason()
        } else {
            reason
        };
        ReviewDecision::Backtrack {
            target_step: target_step.into(),
            edited_state,
            reason,
            edited_prompt,
        }
    }
}

/// Resolves a pending review. Implementations typically block on an
/// external channel (CLI prompt, REST callback) outside this crate; the
/// engine only depends on this trait and a decision eventually arriving.
///
/// A non-interactive implementation must approve automatically unless
/// `config.mode == ReviewMode::Required` under an explicit interactive
/// flag — that policy lives in the handler, not here.
#[async_trait]
pub trait ReviewHandler: Send + Sync {
    async fn request_review(
        &self,
        execution_id: uuid::Uuid,
        node_id: &str,
        config: &ReviewConfig,
    ) -> Result<ReviewDecision>;
}

/// Reviewer that always approves, used when no human-in-the-loop
/// reviewer is configured but a node still declares a review mode for
/// audit-trail purposes.
pub struct AutoApproveReviewHandler;

#[async_trait]
impl ReviewHandler for AutoApproveReviewHandler {
    async fn request_review(
        &self,
        _execution_id: uuid::Uuid,
        _node_id: &str,
        _config: &ReviewConfig,
    ) -> Result<ReviewDecision> {
        Ok(ReviewDecision::Approve { edited_state: None })
    }
}
