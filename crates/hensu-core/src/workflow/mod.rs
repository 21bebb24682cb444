//! The workflow graph (C2), its transition rules (C5), per-node
//! executors (C3), the post-execution processor pipeline (C4), and the
//! executor that drives a run to completion (C9).

pub mod engine;
pub mod executors;
pub mod model;
pub mod pipeline;
pub mod transitions;

pub use engine::{EngineConfig, ExecutionResult, Executor, ExecutorBuilder, WorkflowRegistry};
pub use model::{Node, NodeVariant, TransitionRule, Workflow};
pub use pipeline::{AutoBacktrackThresholds, PipelineOutcome, ProcessorPipeline};
