//! Mutable execution state and its immutable, serializable snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::plan::PlanSnapshot;
use crate::rubric::RubricEvaluation;

/// Status of a single node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Failure,
}

/// Result of executing a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    pub output: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl NodeResult {
    pub fn success(output: impl Into<String>, metadata: HashMap<String, Value>) -> Self {
        Self {
            status: NodeStatus::Success,
            output: Some(output.into()),
            metadata,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), Value::String(message.into()));
        Self {
            status: NodeStatus::Failure,
            output: None,
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

/// A backtrack event recorded alongside a history step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktrackRecord {
    pub from_node_id: String,
    pub to_node_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// One entry in the append-only execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub node_id: String,
    pub result: NodeResult,
    pub timestamp: DateTime<Utc>,
    /// Deep copy of the context immediately after this step was recorded.
    pub context_snapshot: HashMap<String, Value>,
    pub backtrack: Option<BacktrackRecord>,
}

/// Append-only sequence of execution steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionHistory {
    pub steps: Vec<ExecutionStep>,
}

impl ExecutionHistory {
    pub fn push(&mut self, step: ExecutionStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Most recent step for the given node id, if any.
    pub fn last_for_node(&self, node_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().rev().find(|s| s.node_id == node_id)
    }

    /// Walk backwards for the most recent step whose node carries a rubric,
    /// given a lookup from node id to whether it has a rubric configured.
    /// This implements the §9 "most recent prior step with a non-empty
    /// rubricId" backtrack-target rule, with the `first JSON block wins`
    /// note in the spec not applying here (that's a rubric-engine concern).
    pub fn most_recent_rubric_node<F>(&self, before_index: usize, has_rubric: F) -> Option<&str>
    where
        F: Fn(&str) -> bool,
    {
        self.steps[..before_index.min(self.steps.len())]
            .iter()
            .rev()
            .map(|s| s.node_id.as_str())
            .find(|id| has_rubric(id))
    }
}

/// Mutable, per-execution runtime state threaded through the pipeline.
///
/// Conceptually a value passed stage to stage; implemented here as an
/// owned struct mutated in place under the execution's exclusive
/// ownership (see design notes — no aliasing across executions).
#[derive(Debug, Clone)]
pub struct HensuState {
    /// Isolation key for persistence; never crossed by an execution
    /// (§4.11, GLOSSARY). Defaults to `"default"` for embedders that
    /// don't need multi-tenancy.
    pub tenant_id: String,
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub current_node_id: String,
    pub context: HashMap<String, Value>,
    pub history: ExecutionHistory,
    /// Per-node retry counter, reset whenever `current_node_id` changes.
    pub retry_count: u32,
    pub rubric_evaluation: Option<RubricEvaluation>,
    /// One-shot override consumed by the transition post-processor when a
    /// Loop node breaks.
    pub loop_break_target: Option<String>,
    pub active_plan: Option<PlanSnapshot>,
}

/// Tenant used when a caller doesn't need multi-tenancy isolation.
pub const DEFAULT_TENANT_ID: &str = "default";

impl HensuState {
    pub fn new(workflow_id: impl Into<String>, start_node_id: impl Into<String>, initial_context: HashMap<String, Value>) -> Self {
        Self {
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            execution_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            current_node_id: start_node_id.into(),
            context: initial_context,
            history: ExecutionHistory::default(),
            retry_count: 0,
            rubric_evaluation: None,
            loop_break_target: None,
            active_plan: None,
        }
    }

    /// Attach a tenant id, overriding the `"default"` used by `new`.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Reset the per-node retry counter; called whenever the current node
    /// changes (transition taken, backtrack applied, loop iterates).
    pub fn reset_retry_count(&mut self) {
        self.retry_count = 0;
    }

    pub fn set_current_node(&mut self, node_id: impl Into<String>) {
        self.current_node_id = node_id.into();
        self.reset_retry_count();
    }

    /// Produce an immutable checkpoint of this state.
    pub fn snapshot(&self, reason: CheckpointReason) -> HensuSnapshot {
        HensuSnapshot {
            tenant_id: self.tenant_id.clone(),
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id,
            current_node_id: self.current_node_id.clone(),
            context: self.context.clone(),
            history: self.history.clone(),
            active_plan: self.active_plan.clone(),
            created_at: Utc::now(),
            checkpoint_reason: reason,
        }
    }
}

/// Why a snapshot was taken; drives lease-column semantics in the
/// persistence layer (see `persistence::repository`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Checkpoint,
    Completed,
    Paused,
    Failed,
    Rejected,
}

impl CheckpointReason {
    /// Terminal reasons clear the lease columns; `Checkpoint` sets them.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckpointReason::Checkpoint)
    }
}

/// Immutable, serializable checkpoint of a `HensuState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HensuSnapshot {
    pub tenant_id: String,
    pub workflow_id: String,
    pub execution_id: Uuid,
    pub current_node_id: String,
    pub context: HashMap<String, Value>,
    pub history: ExecutionHistory,
    pub active_plan: Option<PlanSnapshot>,
    pub created_at: DateTime<Utc>,
    pub checkpoint_reason: CheckpointReason,
}

impl Default for HensuSnapshot {
    fn default() -> Self {
        Self {
            tenant_id: DEFAULT_TENANT_ID.to_string(),
            workflow_id: String::new(),
            execution_id: Uuid::nil(),
            current_node_id: String::new(),
            context: HashMap::new(),
            history: ExecutionHistory::default(),
            active_plan: None,
            created_at: Utc::now(),
            checkpoint_reason: CheckpointReason::Checkpoint,
        }
    }
}

impl HensuSnapshot {
    /// Reconstruct a fresh mutable `HensuState` for resume.
    pub fn into_state(self) -> HensuState {
        HensuState {
            tenant_id: self.tenant_id,
            execution_id: self.execution_id,
            workflow_id: self.workflow_id,
            current_node_id: self.current_node_id,
            context: self.context,
            history: self.history,
            retry_count: 0,
            rubric_evaluation: None,
            loop_break_target: None,
            active_plan: self.active_plan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trip_preserves_context_and_history() {
        let mut state = HensuState::new("wf-1", "start", HashMap::new());
        state.context.insert("x".into(), Value::from(1));
        state.history.push(ExecutionStep {
            node_id: "start".into(),
            result: NodeResult::success("ok", HashMap::new()),
            timestamp: Utc::now(),
            context_snapshot: state.context.clone(),
            backtrack: None,
        });

        let snap = state.snapshot(CheckpointReason::Checkpoint);
        let restored = snap.into_state();

        assert_eq!(restored.execution_id, state.execution_id);
        assert_eq!(restored.current_node_id, "start");
        assert_eq!(restored.context.get("x"), Some(&Value::from(1)));
        assert_eq!(restored.history.len(), 1);
        assert_eq!(restored.retry_count, 0);
    }

    #[test]
    fn snapshot_json_round_trip_is_idempotent_up_to_timestamps() {
        let state = HensuState::new("wf-1", "start", HashMap::new());
        let snap = state.snapshot(CheckpointReason::Checkpoint);
        let json = serde_json::to_string(&snap).unwrap();
        let reparsed: HensuSnapshot = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&reparsed).unwrap();
        assert_eq!(json, json2);
    }

    #[test]
    fn checkpoint_reason_terminality() {
        assert!(!CheckpointReason::Checkpoint.is_terminal());
        assert!(CheckpointReason::Completed.is_terminal());
        assert!(CheckpointReason::Paused.is_terminal());
        assert!(CheckpointReason::Failed.is_terminal());
        assert!(CheckpointReason::Rejected.is_terminal());
    }

    #[test]
    fn reset_retry_count_on_node_change() {
        let mut state = HensuState::new("wf-1", "a", HashMap::new());
        state.retry_count = 2;
        state.set_current_node("b");
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.current_node_id, "b");
    }

    #[test]
    fn most_recent_rubric_node_walks_backwards() {
        let mut history = ExecutionHistory::default();
        for id in ["a", "b", "c"] {
            history.push(ExecutionStep {
                node_id: id.into(),
                result: NodeResult::success("ok", HashMap::new()),
                timestamp: Utc::now(),
                context_snapshot: HashMap::new(),
                backtrack: None,
            });
        }
        let has_rubric = |id: &str| id == "a";
        let found = history.most_recent_rubric_node(history.len(), has_rubric);
        assert_eq!(found, Some("a"));
    }
}
