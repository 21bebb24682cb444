//! Per-variant node executors (C3) and the shared collaborator bundle
//! they're invoked with.

pub mod action;
pub mod end;
pub mod fork;
pub mod generic;
pub mod join;
pub mod loop_node;
pub mod parallel;
pub mod standard;
pub mod subworkflow;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::action::ActionExecutor;
use crate::agent::AgentRegistry;
use crate::cancellation::CancellationToken;
use crate::registry::{TemplateResolver, ToolRegistry};
use crate::rubric::RubricEngine;
use crate::state::{HensuState, NodeResult};
use crate::validator::AgentOutputValidator;
use crate::workflow::executors::fork::ForkRegistry;
use crate::workflow::model::{Node, Workflow};
use crate::{HensuError, Result};

/// Process-wide collaborators every node executor may need, bundled so
/// callers don't thread a dozen parameters through each `execute` call.
pub struct ExecutorDeps {
    pub agents: Arc<AgentRegistry>,
    pub rubrics: Arc<RubricEngine>,
    pub actions: Arc<dyn ActionExecutor>,
    pub tools: Arc<ToolRegistry>,
    pub resolver: TemplateResolver,
    pub validator: AgentOutputValidator,
    pub chain_runner: Arc<dyn ChainRunner>,
    pub sub_workflows: Arc<dyn SubWorkflowRunner>,
    /// Pending `Fork` branch tasks, claimed by the `Join` node naming
    /// them (§4.2).
    pub fork_registry: Arc<ForkRegistry>,
    /// Cooperative cancellation flag for the enclosing execution (§5).
    pub cancellation: CancellationToken,
}

impl ExecutorDeps {
    /// Observed at node boundaries, before/after plan steps, and around
    /// branch joins. Returns `HensuError::Cancelled` so callers can
    /// propagate it through the same path as any other fatal error.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(HensuError::Cancelled);
        }
        Ok(())
    }
}

/// One variant's execution logic: turn a node plus the current state
/// into a `NodeResult`. Implementations must not advance
/// `state.current_node_id` themselves — that's the pipeline's job.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        workflow: &Workflow,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult>;
}

/// Lets `ForkExecutor` recursively drive a branch of the graph without
/// creating a dependency cycle with `workflow::engine` (which
/// implements this trait).
#[async_trait]
pub trait ChainRunner: Send + Sync {
    /// Execute nodes starting at `start_node_id`, applying the full
    /// post-execution pipeline after each one, until reaching a node
    /// whose id is in `stop_nodes` or an `End` node. Returns the final
    /// state (owned, since branches run concurrently on their own
    /// clones) and the `NodeResult` of the last node executed.
    async fn run_until(
        &self,
        start_node_id: &str,
        stop_nodes: &HashSet<String>,
        workflow: &Workflow,
        state: HensuState,
        cancellation: &CancellationToken,
    ) -> Result<(HensuState, NodeResult)>;
}

/// Runs a nested workflow by id to completion and returns its final
/// context, for `SubWorkflowExecutor`. The engine implements this by
/// loading the referenced `Workflow` and driving its own `Executor`.
#[async_trait]
pub trait SubWorkflowRunner: Send + Sync {
    async fn run(
        &self,
        workflow_id: &str,
        input_context: HashMap<String, Value>,
        cancellation: &CancellationToken,
    ) -> Result<HashMap<String, Value>>;
}

/// Resolve the executor for a node's kind.
pub fn executor_for(node: &Node) -> Box<dyn NodeExecutor> {
    match node.kind() {
        "standard" => Box::new(standard::StandardExecutor),
        "parallel" => Box::new(parallel::ParallelExecutor),
        "fork" => Box::new(fork::ForkExecutor),
        "join" => Box::new(join::JoinExecutor),
        "loop" => Box::new(loop_node::LoopExecutor),
        "action" => Box::new(action::ActionNodeExecutor),
        "generic" => Box::new(generic::GenericExecutor),
        "sub_workflow" => Box::new(subworkflow::SubWorkflowExecutor),
        "end" => Box::new(end::EndExecutor),
        other => unreachable!("unknown node kind '{other}'"),
    }
}
