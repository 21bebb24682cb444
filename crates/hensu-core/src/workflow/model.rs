//! Immutable workflow graph: nodes, transitions, agents, rubrics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HensuError;
use crate::Result;

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Global execution config carried on a `Workflow` (timeouts, retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub default_timeout_seconds: u64,
    pub default_max_retries: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 120,
            default_max_retries: 0,
        }
    }
}

/// Optional descriptive metadata; never consulted by the engine itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub tags: Vec<String>,
}

/// Configuration for one agent referenced by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub model: String,
    pub role: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub tool_ids: Vec<String>,
    pub instructions: Option<String>,
    /// Adapter routing hint, consumed only by the (external) provider
    /// layer — the core never interprets this field.
    pub provider_hint: Option<String>,
}

/// Immutable, read-only-after-construction workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub version: String,
    pub start_node_id: String,
    pub agents: HashMap<String, AgentConfig>,
    pub rubrics: HashMap<String, String>,
    pub nodes: HashMap<String, Node>,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    #[serde(default)]
    pub config: WorkflowConfig,
}

impl Workflow {
    /// Validate structural invariants (§3): start node exists, every
    /// `rubric_id` referenced by a node or branch is declared, and every
    /// agent id referenced by a node is declared.
    pub fn validate(&self) -> Result<()> {
        if !self.nodes.contains_key(&self.start_node_id) {
            return Err(HensuError::Definition(format!(
                "start_node_id '{}' is not in nodes",
                self.start_node_id
            )));
        }

        for (id, node) in &self.nodes {
            if let Some(rubric_id) = node.rubric_id() {
                if !self.rubrics.contains_key(rubric_id) {
                    return Err(HensuError::Definition(format!(
                        "node '{id}' references unknown rubric '{rubric_id}'"
                    )));
                }
            }

            match &node.variant {
                NodeVariant::Standard(n) => {
                    if !self.agents.contains_key(&n.agent_id) {
                        return Err(HensuError::Definition(format!(
                            "node '{id}' references unknown agent '{}'",
                            n.agent_id
                        )));
                    }
                }
                NodeVariant::Parallel(n) => {
                    for branch in &n.branches {
                        if !self.agents.contains_key(&branch.agent_id) {
                            return Err(HensuError::Definition(format!(
                                "branch '{}' of node '{id}' references unknown agent '{}'",
                                branch.id, branch.agent_id
                            )));
                        }
                        if let Some(rubric_id) = &branch.rubric_id {
                            if !self.rubrics.contains_key(rubric_id) {
                                return Err(HensuError::Definition(format!(
                                    "branch '{}' of node '{id}' references unknown rubric '{rubric_id}'",
                                    branch.id
                                )));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A node in the workflow graph; the tagged variant carries its
/// variant-specific fields (`NodeVariant`). Fields common to every
/// variant live on `Node` itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub variant: NodeVariant,
    pub transition_rules: Vec<TransitionRule>,
    pub rubric_id: Option<String>,
    #[serde(default)]
    pub review: crate::review::ReviewConfig,
}

impl Node {
    pub fn rubric_id(&self) -> Option<&str> {
        self.rubric_id.as_deref()
    }

    pub fn is_end(&self) -> bool {
        self.variant.is_end()
    }

    pub fn kind(&self) -> &'static str {
        self.variant.kind()
    }
}

/// Planning mode for a Standard node's tool-use response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMode {
    #[default]
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardNode {
    pub agent_id: String,
    pub prompt: String,
    pub output_params: Option<Vec<String>>,
    pub plan_failure_target: Option<String>,
    #[serde(default)]
    pub planning_mode: PlanningMode,
    pub max_plan_steps: Option<u32>,
    pub max_plan_replans: Option<u32>,
    /// Overrides `workflow.config.default_timeout_seconds` for this
    /// node's agent call.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub agent_id: String,
    pub prompt: String,
    pub rubric_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusKind {
    All,
    Majority,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusStrategy {
    pub kind: ConsensusKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelNode {
    pub branches: Vec<Branch>,
    pub consensus: Option<ConsensusStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkNode {
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    CollectAll,
    FirstCompleted,
    Concatenate,
    MergeMaps,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinNode {
    pub await_targets: Vec<String>,
    pub merge_strategy: MergeStrategy,
    pub output_field: Option<String>,
    /// Name of a registered custom merge function; required when
    /// `merge_strategy == Custom`.
    pub custom_merge_fn: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakRule {
    pub condition: ScoreCondition,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopNode {
    pub body_target: String,
    pub break_rules: Vec<BreakRule>,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Send {
        handler_id: String,
        payload: HashMap<String, Value>,
    },
    Execute {
        command_id: String,
        args: HashMap<String, Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionNode {
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericNode {
    pub executor_type: String,
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowNode {
    pub workflow_id: String,
    pub input_mapping: HashMap<String, String>,
    pub output_mapping: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndNode {
    pub exit_status: ExitStatus,
}

/// The tagged variant identifying a node's behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeVariant {
    Standard(StandardNode),
    Parallel(ParallelNode),
    Fork(ForkNode),
    Join(JoinNode),
    Loop(LoopNode),
    Action(ActionNode),
    Generic(GenericNode),
    SubWorkflow(SubWorkflowNode),
    End(EndNode),
}

impl NodeVariant {
    pub fn is_end(&self) -> bool {
        matches!(self, NodeVariant::End(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeVariant::Standard(_) => "standard",
            NodeVariant::Parallel(_) => "parallel",
            NodeVariant::Fork(_) => "fork",
            NodeVariant::Join(_) => "join",
            NodeVariant::Loop(_) => "loop",
            NodeVariant::Action(_) => "action",
            NodeVariant::Generic(_) => "generic",
            NodeVariant::SubWorkflow(_) => "sub_workflow",
            NodeVariant::End(_) => "end",
        }
    }
}

// ---------------------------------------------------------------------------
// Transition rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Range,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreCondition {
    pub op: ScoreOp,
    pub value: Option<f64>,
    pub range: Option<(f64, f64)>,
    pub target: String,
}

impl ScoreCondition {
    /// Returns `Some(target)` iff `score` satisfies this condition.
    pub fn matches(&self, score: f64) -> bool {
        match self.op {
            ScoreOp::Gt => self.value.is_some_and(|v| score > v),
            ScoreOp::Gte => self.value.is_some_and(|v| score >= v),
            ScoreOp::Lt => self.value.is_some_and(|v| score < v),
            ScoreOp::Lte => self.value.is_some_and(|v| score <= v),
            ScoreOp::Eq => self.value.is_some_and(|v| (score - v).abs() < f64::EPSILON),
            ScoreOp::Range => self
                .range
                .is_some_and(|(lo, hi)| score >= lo && score <= hi),
        }
    }
}

/// Evaluated in definition order on each `NodeResult`; the first rule
/// returning a non-null target wins (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionRule {
    Success { target: String },
    Failure { retry_count: u32, target: String },
    Always { target: String },
    Score { conditions: Vec<ScoreCondition> },
    RubricFail { target: String },
}
