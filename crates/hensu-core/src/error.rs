use thiserror::Error;

/// Top-level error type for the hensu-core library.
///
/// Variants mirror the error kinds enumerated in the engine design:
/// agent/rubric/transition/persistence/review failures each get their
/// own kind so callers can match on cause rather than parse a message.
#[derive(Debug, Error)]
pub enum HensuError {
    /// Referenced agent id is not present in the registry.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// No registered `AgentProvider` supports the requested model.
    #[error("no provider registered for model '{0}'")]
    ProviderMissingForModel(String),

    /// The agent call itself failed (network, process, provider error).
    #[error("agent execution error: {0}")]
    AgentExecutionError(String),

    /// Referenced rubric id is not present in the workflow's rubric map.
    #[error("rubric not found: {0}")]
    RubricNotFound(String),

    /// Rubric evaluation could not be completed.
    #[error("rubric evaluation error: {0}")]
    RubricEvaluationError(String),

    /// No transition rule matched and the node is not an End node.
    #[error("no valid transition from {0}")]
    NoMatchingTransition(String),

    /// `currentNodeId` does not exist in `workflow.nodes`.
    #[error("missing node: {0}")]
    MissingNode(String),

    /// The per-workflow step cap (`max_execution_steps`) was reached.
    #[error("execution budget exceeded (max_execution_steps={0})")]
    StepCapExceeded(u64),

    /// A structural invariant of the workflow or state was violated.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// Agent output failed the safety validator.
    #[error("unsafe agent output: {0}")]
    UnsafeAgentOutput(String),

    /// An Action node or plan step referenced an unregistered handler.
    #[error("action handler missing: {0}")]
    ActionHandlerMissing(String),

    /// An action handler ran but reported failure.
    #[error("action execution error: {0}")]
    ActionExecutionError(String),

    /// A human reviewer rejected the result.
    #[error("review rejected: {0}")]
    ReviewRejected(String),

    /// A review decision named a backtrack target not present in history.
    #[error("review backtrack invalid: {0}")]
    ReviewBacktrackInvalid(String),

    /// Snapshot save/load failed.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// This node's lease on the execution was lost to another owner.
    #[error("lease lost for execution {0}")]
    LeaseLost(String),

    /// A planner failed to produce a usable plan.
    #[error("plan creation error: {0}")]
    PlanCreationError(String),

    /// A planner failed to revise a plan after a failed step.
    #[error("plan revision error: {0}")]
    PlanRevisionError(String),

    /// A single plan step exceeded its timeout.
    #[error("step timed out: {0}")]
    StepTimeout(String),

    /// An agent or action call exceeded its node/workflow-configured timeout.
    #[error("node call timed out after {0:?}")]
    NodeTimeout(std::time::Duration),

    /// The execution's cancellation flag was observed at a checkpoint
    /// boundary (node, plan step, or branch join).
    #[error("execution cancelled")]
    Cancelled,

    /// Workflow definition failed structural validation.
    #[error("workflow definition error: {0}")]
    Definition(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps `serde_json::Error`.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, HensuError>;
