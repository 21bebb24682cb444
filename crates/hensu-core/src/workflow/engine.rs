//! Execution engine (C9): drives a `HensuState` through a `Workflow`
//! node by node, applying the post-execution pipeline after each step,
//! checkpointing progress, and exposing itself as the `ChainRunner` /
//! `SubWorkflowRunner` the Fork/Loop/SubWorkflow executors call back
//! into.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::action::ActionExecutor;
use crate::agent::AgentRegistry;
use crate::cancellation::CancellationToken;
use crate::events::{EventSink, ExecutionEvent, NullEventSink};
use crate::persistence::WorkflowStateRepository;
use crate::registry::{TemplateResolver, ToolRegistry};
use crate::review::{AutoApproveReviewHandler, ReviewHandler};
use crate::rubric::RubricEngine;
use crate::state::{CheckpointReason, HensuSnapshot, HensuState, NodeResult};
use crate::validator::AgentOutputValidator;
use crate::workflow::executors::fork::ForkRegistry;
use crate::workflow::executors::{executor_for, ChainRunner, ExecutorDeps, SubWorkflowRunner};
use crate::workflow::model::{ExitStatus, Workflow};
use crate::workflow::pipeline::{AutoBacktrackThresholds, PipelineOutcome, ProcessorPipeline};
use crate::{HensuError, Result};

/// Tunables that aren't part of the workflow definition itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_execution_steps: u64,
    pub auto_backtrack: AutoBacktrackThresholds,
    pub server_node_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_execution_steps: 10_000,
            auto_backtrack: AutoBacktrackThresholds::default(),
            server_node_id: "local".to_string(),
        }
    }
}

/// Terminal or suspended outcome of driving an execution.
pub enum ExecutionResult {
    Completed {
        snapshot: HensuSnapshot,
        exit_status: ExitStatus,
    },
    Paused {
        snapshot: HensuSnapshot,
        node_id: String,
        reason: String,
    },
    Rejected {
        snapshot: HensuSnapshot,
        node_id: String,
        reason: String,
    },
    Failed {
        snapshot: HensuSnapshot,
        node_id: String,
        error: String,
    },
}

/// A registry of loadable workflows, consulted when a `SubWorkflow`
/// node references another workflow by id.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, workflow: Workflow) {
        self.workflows.write().unwrap().insert(workflow.id.clone(), workflow);
    }

    pub fn get(&self, id: &str) -> Option<Workflow> {
        self.workflows.read().unwrap().get(id).cloned()
    }
}

/// Drives one workflow's execution graph. Implements `ChainRunner` and
/// `SubWorkflowRunner` on itself (via a self-`Weak` reference) so
/// Fork/Loop/SubWorkflow nodes can recurse back into the engine without
/// a dependency cycle between modules.
pub struct Executor {
    self_ref: Weak<Executor>,
    workflow: Workflow,
    workflow_registry: Arc<WorkflowRegistry>,
    agents: Arc<AgentRegistry>,
    rubrics: Arc<RubricEngine>,
    actions: Arc<dyn ActionExecutor>,
    tools: Arc<ToolRegistry>,
    fork_registry: Arc<ForkRegistry>,
    pipeline: ProcessorPipeline,
    repository: Option<Arc<dyn WorkflowStateRepository>>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

pub struct ExecutorBuilder {
    workflow: Workflow,
    workflow_registry: Arc<WorkflowRegistry>,
    agents: Arc<AgentRegistry>,
    rubrics: Arc<RubricEngine>,
    actions: Arc<dyn ActionExecutor>,
    tools: Arc<ToolRegistry>,
    review_handler: Arc<dyn ReviewHandler>,
    repository: Option<Arc<dyn WorkflowStateRepository>>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl ExecutorBuilder {
    pub fn new(
        workflow: Workflow,
        agents: Arc<AgentRegistry>,
        rubrics: Arc<RubricEngine>,
        actions: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            workflow,
            workflow_registry: Arc::new(WorkflowRegistry::new()),
            agents,
            rubrics,
            actions,
            tools: Arc::new(ToolRegistry::new()),
            review_handler: Arc::new(AutoApproveReviewHandler),
            repository: None,
            events: Arc::new(NullEventSink),
            config: EngineConfig::default(),
        }
    }

    pub fn with_workflow_registry(mut self, registry: Arc<WorkflowRegistry>) -> Self {
        self.workflow_registry = registry;
        self
    }

    pub fn with_review_handler(mut self, handler: Arc<dyn ReviewHandler>) -> Self {
        self.review_handler = handler;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn WorkflowStateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Arc<Executor>> {
        self.workflow.validate()?;
        let pipeline = ProcessorPipeline::new(
            Arc::clone(&self.rubrics),
            Arc::clone(&self.review_handler),
            self.config.auto_backtrack,
        );
        Ok(Arc::new_cyclic(|self_ref| Executor {
            self_ref: self_ref.clone(),
            workflow: self.workflow,
            workflow_registry: self.workflow_registry,
            agents: self.agents,
            rubrics: self.rubrics,
            actions: self.actions,
            tools: self.tools,
            fork_registry: Arc::new(ForkRegistry::new()),
            pipeline,
            repository: self.repository,
            events: self.events,
            config: self.config,
        }))
    }
}

impl Executor {
    fn arc_self(&self) -> Arc<Executor> {
        self.self_ref
            .upgrade()
            .expect("Executor is always held behind the Arc created in ExecutorBuilder::build")
    }

    fn executor_deps(&self, cancellation: &CancellationToken) -> ExecutorDeps {
        let arc_self = self.arc_self();
        ExecutorDeps {
            agents: Arc::clone(&self.agents),
            rubrics: Arc::clone(&self.rubrics),
            actions: Arc::clone(&self.actions),
            tools: Arc::clone(&self.tools),
            resolver: TemplateResolver,
            validator: AgentOutputValidator,
            chain_runner: arc_self.clone() as Arc<dyn ChainRunner>,
            sub_workflows: arc_self as Arc<dyn SubWorkflowRunner>,
            fork_registry: Arc::clone(&self.fork_registry),
            cancellation: cancellation.clone(),
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Build the initial state for a fresh execution without driving it,
    /// so callers (the `Environment` facade) can learn the execution id
    /// before the run starts in order to arm a lease heartbeat around it.
    pub fn new_state(&self, initial_context: HashMap<String, Value>) -> HensuState {
        HensuState::new(
            self.workflow.id.clone(),
            self.workflow.start_node_id.clone(),
            initial_context,
        )
    }

    /// Start a fresh execution from the workflow's start node.
    pub async fn start(&self, initial_context: HashMap<String, Value>) -> Result<ExecutionResult> {
        self.start_with_cancellation(initial_context, CancellationToken::new()).await
    }

    /// Like `start`, but ties the run to a caller-supplied cancellation
    /// token so it can be stopped from outside (`Environment::cancel`).
    pub async fn start_with_cancellation(
        &self,
        initial_context: HashMap<String, Value>,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult> {
        let state = self.new_state(initial_context);
        self.events.emit(ExecutionEvent::ExecutionStarted {
            execution_id: state.execution_id,
            workflow_id: self.workflow.id.clone(),
            at: Utc::now(),
        });
        self.run_with_cancellation(state, cancellation).await
    }

    /// Resume a previously checkpointed execution.
    pub async fn resume(&self, snapshot: HensuSnapshot) -> Result<ExecutionResult> {
        self.resume_with_cancellation(snapshot, CancellationToken::new()).await
    }

    /// Like `resume`, but ties the run to a caller-supplied cancellation
    /// token.
    pub async fn resume_with_cancellation(
        &self,
        snapshot: HensuSnapshot,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult> {
        let state = snapshot.into_state();
        self.run_with_cancellation(state, cancellation).await
    }

    /// Drive an already-constructed state to completion or suspension.
    /// `start`/`resume` are thin wrappers; `Environment` calls this
    /// directly once it has armed a lease heartbeat for the state's
    /// execution id.
    pub async fn run(&self, state: HensuState) -> Result<ExecutionResult> {
        self.run_with_cancellation(state, CancellationToken::new()).await
    }

    /// Like `run`, but checked for cancellation at every node boundary;
    /// a token that's never cancelled (the default in `run`) is
    /// effectively free to poll.
    pub async fn run_with_cancellation(
        &self,
        mut state: HensuState,
        cancellation: CancellationToken,
    ) -> Result<ExecutionResult> {
        self.drive(&self.workflow, &mut state, &cancellation).await
    }

    async fn checkpoint(&self, state: &HensuState, reason: CheckpointReason) -> Result<HensuSnapshot> {
        let snapshot = state.snapshot(reason);
        if let Some(repository) = &self.repository {
            repository.save(&snapshot, &self.config.server_node_id).await?;
        }
        Ok(snapshot)
    }

    async fn drive(
        &self,
        workflow: &Workflow,
        state: &mut HensuState,
        cancellation: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let mut steps: u64 = 0;
        loop {
            steps += 1;
            if steps > self.config.max_execution_steps {
                return Err(HensuError::StepCapExceeded(self.config.max_execution_steps));
            }

            let node = workflow
                .node(&state.current_node_id)
                .ok_or_else(|| HensuError::MissingNode(state.current_node_id.clone()))?
                .clone();

            let deps = self.executor_deps(cancellation);
            let executor = executor_for(&node);
            let outcome = match deps.check_cancelled() {
                Ok(()) => executor.execute(&node, workflow, state, &deps).await,
                Err(e) => Err(e),
            };
            let result = match outcome {
                Ok(r) => r,
                Err(e) => {
                    let snapshot = self.checkpoint(state, CheckpointReason::Failed).await?;
                    self.events.emit(ExecutionEvent::ExecutionError {
                        execution_id: state.execution_id,
                        node_id: Some(node.id.clone()),
                        message: e.to_string(),
                        at: Utc::now(),
                    });
                    return Ok(ExecutionResult::Failed {
                        snapshot,
                        node_id: node.id,
                        error: e.to_string(),
                    });
                }
            };

            self.events.emit(ExecutionEvent::NodeResult {
                execution_id: state.execution_id,
                node_id: node.id.clone(),
                score: state.rubric_evaluation.as_ref().map(|e| e.score),
                context: serde_json::to_value(&state.context).unwrap_or(Value::Null),
                at: Utc::now(),
            });

            let outcome = self.pipeline.process(&node, workflow, state, result).await?;

            match outcome {
                PipelineOutcome::Advance { target } => {
                    state.set_current_node(target);
                    self.checkpoint(state, CheckpointReason::Checkpoint).await?;
                }
                PipelineOutcome::Retry => {
                    self.checkpoint(state, CheckpointReason::Checkpoint).await?;
                }
                PipelineOutcome::Backtrack { .. } => {
                    self.checkpoint(state, CheckpointReason::Checkpoint).await?;
                }
                PipelineOutcome::Paused { reason } => {
                    let snapshot = self.checkpoint(state, CheckpointReason::Paused).await?;
                    self.events.emit(ExecutionEvent::ExecutionPaused {
                        execution_id: state.execution_id,
                        node_id: node.id.clone(),
                        reason: reason.clone(),
                        at: Utc::now(),
                    });
                    return Ok(ExecutionResult::Paused {
                        snapshot,
                        node_id: node.id,
                        reason,
                    });
                }
                PipelineOutcome::Rejected { reason } => {
                    let snapshot = self.checkpoint(state, CheckpointReason::Rejected).await?;
                    return Ok(ExecutionResult::Rejected {
                        snapshot,
                        node_id: node.id,
                        reason,
                    });
                }
                PipelineOutcome::Complete { exit_status } => {
                    // §6: the End node's `exitStatus` decides whether the
                    // run terminates as Completed or Rejected.
                    match exit_status {
                        ExitStatus::Success => {
                            let snapshot = self.checkpoint(state, CheckpointReason::Completed).await?;
                            self.events.emit(ExecutionEvent::ExecutionCompleted {
                                execution_id: state.execution_id,
                                node_id: node.id,
                                at: Utc::now(),
                            });
                            return Ok(ExecutionResult::Completed { snapshot, exit_status });
                        }
                        ExitStatus::Failure => {
                            let snapshot = self.checkpoint(state, CheckpointReason::Rejected).await?;
                            let reason = format!("end node '{}' exited with Failure status", node.id);
                            return Ok(ExecutionResult::Rejected {
                                snapshot,
                                node_id: node.id,
                                reason,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Lightweight node-stepping used by `ChainRunner::run_until`: no
    /// checkpointing or event emission, since branch/loop sub-chains
    /// aren't independently resumable — only the enclosing execution is.
    async fn step_until(
        &self,
        start_node_id: &str,
        stop_nodes: &HashSet<String>,
        workflow: &Workflow,
        mut state: HensuState,
        cancellation: &CancellationToken,
    ) -> Result<(HensuState, NodeResult)> {
        state.set_current_node(start_node_id.to_string());
        let mut steps: u64 = 0;
        loop {
            steps += 1;
            if steps > self.config.max_execution_steps {
                return Err(HensuError::StepCapExceeded(self.config.max_execution_steps));
            }

            if stop_nodes.contains(&state.current_node_id) {
                return Ok((state.clone(), NodeResult::success("chain stopped", HashMap::new())));
            }

            if cancellation.is_cancelled() {
                return Err(HensuError::Cancelled);
            }

            let node = workflow
                .node(&state.current_node_id)
                .ok_or_else(|| HensuError::MissingNode(state.current_node_id.clone()))?
                .clone();

            let deps = self.executor_deps(cancellation);
            let executor = executor_for(&node);
            let result = executor.execute(&node, workflow, &mut state, &deps).await?;

            let outcome = self
                .pipeline
                .process(&node, workflow, &mut state, result.clone())
                .await?;
            match outcome {
                PipelineOutcome::Advance { target } => state.set_current_node(target),
                PipelineOutcome::Backtrack { target } => state.set_current_node(target),
                PipelineOutcome::Retry => {}
                PipelineOutcome::Paused { .. } | PipelineOutcome::Rejected { .. } => {
                    return Ok((state, result));
                }
                PipelineOutcome::Complete { .. } => return Ok((state, result)),
            }
        }
    }
}

#[async_trait]
impl ChainRunner for Executor {
    async fn run_until(
        &self,
        start_node_id: &str,
        stop_nodes: &HashSet<String>,
        workflow: &Workflow,
        state: HensuState,
        cancellation: &CancellationToken,
    ) -> Result<(HensuState, NodeResult)> {
        self.step_until(start_node_id, stop_nodes, workflow, state, cancellation).await
    }
}

#[async_trait]
impl SubWorkflowRunner for Executor {
    async fn run(
        &self,
        workflow_id: &str,
        input_context: HashMap<String, Value>,
        cancellation: &CancellationToken,
    ) -> Result<HashMap<String, Value>> {
        let sub_workflow = self
            .workflow_registry
            .get(workflow_id)
            .ok_or_else(|| HensuError::MissingNode(format!("sub-workflow '{workflow_id}' is not registered")))?;

        let state = HensuState::new(sub_workflow.id.clone(), sub_workflow.start_node_id.clone(), input_context);
        let stop_nodes = HashSet::new();
        let (final_state, _) = self
            .step_until(&sub_workflow.start_node_id.clone(), &stop_nodes, &sub_workflow, state, cancellation)
            .await?;
        Ok(final_state.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::InProcessActionExecutor;
    use crate::agent::{AgentRegistry, StubAgentProvider};
    use crate::rubric::RubricEngine;
    use crate::workflow::model::{
        AgentConfig, EndNode, ExitStatus, Node, NodeVariant, PlanningMode, StandardNode,
        TransitionRule, Workflow, WorkflowConfig, WorkflowMetadata,
    };
    use std::sync::Arc;

    fn simple_workflow() -> Workflow {
        let mut nodes = HashMap::new();
        nodes.insert(
            "start".to_string(),
            Node {
                id: "start".into(),
                variant: NodeVariant::Standard(StandardNode {
                    agent_id: "writer".into(),
                    prompt: "write something".into(),
                    output_params: None,
                    plan_failure_target: None,
                    planning_mode: PlanningMode::Disabled,
                    max_plan_steps: None,
                    max_plan_replans: None,
                    timeout_seconds: None,
                }),
                transition_rules: vec![TransitionRule::Success { target: "end".into() }],
                rubric_id: None,
                review: crate::review::ReviewConfig::default(),
            },
        );
        nodes.insert(
            "end".to_string(),
            Node {
                id: "end".into(),
                variant: NodeVariant::End(EndNode { exit_status: ExitStatus::Success }),
                transition_rules: vec![],
                rubric_id: None,
                review: crate::review::ReviewConfig::default(),
            },
        );

        Workflow {
            id: "wf".into(),
            version: "1.0.0".into(),
            start_node_id: "start".into(),
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
            rubrics: HashMap::new(),
            nodes,
            metadata: WorkflowMetadata::default(),
            config: WorkflowConfig::default(),
        }
    }

    fn build_executor(workflow: Workflow) -> Arc<Executor> {
        let agents = Arc::new(AgentRegistry::new());
        agents.register_provider(Arc::new(StubAgentProvider));
        let rubrics = Arc::new(RubricEngine::new(HashMap::new()));
        let actions: Arc<dyn ActionExecutor> = Arc::new(InProcessActionExecutor::new());
        ExecutorBuilder::new(workflow, agents, rubrics, actions)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn happy_path_completes_via_stub_agent() {
        let executor = build_executor(simple_workflow());
        let result = executor.start(HashMap::new()).await.unwrap();
        match result {
            ExecutionResult::Completed { exit_status, .. } => assert_eq!(exit_status, ExitStatus::Success),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn resume_from_snapshot_continues_execution() {
        let executor = build_executor(simple_workflow());
        let state = HensuState::new("wf", "end", HashMap::new());
        let snapshot = state.snapshot(CheckpointReason::Paused);
        let result = executor.resume(snapshot).await.unwrap();
        assert!(matches!(result, ExecutionResult::Completed { .. }));
    }

    #[tokio::test]
    async fn missing_node_errors() {
        let mut workflow = simple_workflow();
        workflow.start_node_id = "start".into();
        let executor = build_executor(workflow);
        let state = HensuState::new("wf", "nope", HashMap::new());
        let result = executor.resume(state.snapshot(CheckpointReason::Checkpoint)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_run_before_first_node() {
        let executor = build_executor(simple_workflow());
        let token = CancellationToken::new();
        token.cancel();
        let result = executor.start_with_cancellation(HashMap::new(), token).await.unwrap();
        match result {
            ExecutionResult::Failed { error, .. } => {
                assert!(error.contains("cancel"), "unexpected error message: {error}");
            }
            _ => panic!("expected a cancelled run to fail"),
        }
    }
}
