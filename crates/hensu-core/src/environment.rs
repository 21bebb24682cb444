//! `Environment`: the crate's public facade, composing `Executor` with
//! `WorkflowStateRepository` persistence and `LeaseManager` heartbeats
//! so callers don't have to wire those together themselves (§6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::cancellation::CancellationRegistry;
use crate::events::{EventSink, NullEventSink};
use crate::persistence::{reclaim_stale_executions, LeaseManager, WorkflowStateRepository};
use crate::workflow::engine::{ExecutionResult, Executor};
use crate::{HensuError, Result};

/// Tunables for the lease heartbeat `Environment` arms around a run.
#[derive(Debug, Clone, Copy)]
pub struct LeaseSettings {
    pub heartbeat_interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

/// Composes an `Executor` with optional persistence so a caller gets a
/// single `start`/`resume` entry point with crash-recovery and
/// heartbeating handled underneath.
pub struct Environment {
    executor: Arc<Executor>,
    repository: Option<Arc<dyn WorkflowStateRepository>>,
    events: Arc<dyn EventSink>,
    owner: String,
    lease: LeaseSettings,
    cancellations: Arc<CancellationRegistry>,
}

impl Environment {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            repository: None,
            events: Arc::new(NullEventSink),
            owner: "local".to_string(),
            lease: LeaseSettings::default(),
            cancellations: Arc::new(CancellationRegistry::new()),
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn WorkflowStateRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_lease_settings(mut self, lease: LeaseSettings) -> Self {
        self.lease = lease;
        self
    }

    /// The event sink this environment was built with, for callers that
    /// want to subscribe to or drain execution events out of band.
    pub fn events(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.events)
    }

    /// Start a fresh execution under `tenant_id`, heartbeating its lease
    /// for the duration of the run if a repository is configured. The
    /// execution is registered with this environment's cancellation
    /// registry for the duration of the call, so a concurrent
    /// `cancel(execution_id)` can stop it cooperatively (§5).
    pub async fn start(
        &self,
        tenant_id: impl Into<String>,
        initial_context: HashMap<String, Value>,
    ) -> Result<ExecutionResult> {
        let tenant_id = tenant_id.into();
        let state = self.executor.new_state(initial_context).with_tenant(tenant_id.clone());
        let execution_id = state.execution_id;
        let _lease = self.arm_lease(tenant_id, execution_id);
        let token = self.cancellations.register(execution_id);
        let result = self.executor.run_with_cancellation(state, token).await;
        self.cancellations.unregister(execution_id);
        result
    }

    /// Resume a previously checkpointed execution by `(tenant_id,
    /// execution_id)`, loading its snapshot from the repository. A
    /// lookup under the wrong tenant never finds another tenant's row
    /// (GLOSSARY "Tenant").
    pub async fn resume(&self, tenant_id: &str, execution_id: Uuid) -> Result<ExecutionResult> {
        let repository = self
            .repository
            .as_ref()
            .ok_or_else(|| HensuError::PersistenceError("no repository configured".to_string()))?;
        let snapshot = repository
            .load(tenant_id, execution_id)
            .await?
            .ok_or_else(|| HensuError::PersistenceError(format!("no snapshot for {execution_id}")))?;
        let _lease = self.arm_lease(tenant_id.to_string(), execution_id);
        let token = self.cancellations.register(execution_id);
        let result = self.executor.resume_with_cancellation(snapshot, token).await;
        self.cancellations.unregister(execution_id);
        result
    }

    /// Request cooperative cancellation of an in-flight execution by id.
    /// Returns `false` if no execution with that id is currently
    /// registered (already finished, or never started through this
    /// environment instance).
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        self.cancellations.cancel(execution_id)
    }

    /// Sweep the repository for leases whose heartbeat is older than
    /// `lease.stale_threshold`, reclaim them under this environment's
    /// owner, and resume each from its last snapshot within its own
    /// tenant.
    pub async fn reclaim_and_resume_stale(&self) -> Result<Vec<ExecutionResult>> {
        let Some(repository) = &self.repository else {
            return Ok(Vec::new());
        };
        let reclaimed =
            reclaim_stale_executions(repository.as_ref(), self.lease.stale_threshold, &self.owner)
                .await?;

        let mut results = Vec::with_capacity(reclaimed.len());
        for (tenant_id, execution_id) in reclaimed {
            results.push(self.resume(&tenant_id, execution_id).await?);
        }
        Ok(results)
    }

    fn arm_lease(&self, tenant_id: String, execution_id: Uuid) -> Option<LeaseManager> {
        self.repository.as_ref().map(|repository| {
            LeaseManager::spawn(
                Arc::clone(repository),
                tenant_id,
                execution_id,
                self.owner.clone(),
                self.lease.heartbeat_interval,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::InProcessActionExecutor;
    use crate::agent::{AgentRegistry, StubAgentProvider};
    use crate::persistence::FsStateRepository;
    use crate::rubric::RubricEngine;
    use crate::workflow::engine::ExecutorBuilder;
    use crate::workflow::model::{
        AgentConfig, EndNode, ExitStatus, Node, NodeVariant, PlanningMode, StandardNode,
        TransitionRule, Workflow, WorkflowConfig, WorkflowMetadata,
    };

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

    fn build_environment(repo_dir: &std::path::Path) -> Environment {
        let agents = Arc::new(AgentRegistry::new());
        agents.register_provider(Arc::new(StubAgentProvider));
        let rubrics = Arc::new(RubricEngine::new(HashMap::new()));
        let actions: Arc<dyn crate::action::ActionExecutor> =
            Arc::new(InProcessActionExecutor::new());
        let executor = ExecutorBuilder::new(simple_workflow(), agents, rubrics, actions)
            .build()
            .unwrap();
        let repository: Arc<dyn WorkflowStateRepository> =
            Arc::new(FsStateRepository::new(repo_dir));
        Environment::new(executor).with_repository(repository)
    }

    #[tokio::test]
    async fn start_completes_and_persists_terminal_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let env = build_environment(tmp.path());
        let result = env.start("acme", HashMap::new()).await.unwrap();
        assert!(matches!(result, ExecutionResult::Completed { .. }));
    }

    #[tokio::test]
    async fn resume_without_repository_errors() {
        let agents = Arc::new(AgentRegistry::new());
        agents.register_provider(Arc::new(StubAgentProvider));
        let rubrics = Arc::new(RubricEngine::new(HashMap::new()));
        let actions: Arc<dyn crate::action::ActionExecutor> =
            Arc::new(InProcessActionExecutor::new());
        let executor = ExecutorBuilder::new(simple_workflow(), agents, rubrics, actions)
            .build()
            .unwrap();
        let env = Environment::new(executor);
        let err = env.resume("acme", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, HensuError::PersistenceError(_)));
    }

    #[tokio::test]
    async fn cancel_unknown_execution_id_returns_false() {
        let tmp = tempfile::tempdir().unwrap();
        let env = build_environment(tmp.path());
        assert!(!env.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn execution_is_unregistered_from_cancellation_registry_after_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let env = build_environment(tmp.path());
        let result = env.start("acme", HashMap::new()).await.unwrap();
        let execution_id = match result {
            ExecutionResult::Completed { snapshot, .. } => snapshot.execution_id,
            _ => panic!("expected completion"),
        };
        // The run already finished, so its token was unregistered; a late
        // cancel for the same id must be a no-op rather than reaching a
        // stale or reused entry.
        assert!(!env.cancel(execution_id));
    }

    #[tokio::test]
    async fn reclaim_and_resume_stale_with_no_repository_is_noop() {
        let agents = Arc::new(AgentRegistry::new());
        agents.register_provider(Arc::new(StubAgentProvider));
        let rubrics = Arc::new(RubricEngine::new(HashMap::new()));
        let actions: Arc<dyn crate::action::ActionExecutor> =
            Arc::new(InProcessActionExecutor::new());
        let executor = ExecutorBuilder::new(simple_workflow(), agents, rubrics, actions)
            .build()
            .unwrap();
        let env = Environment::new(executor);
        let results = env.reclaim_and_resume_stale().await.unwrap();
        assert!(results.is_empty());
    }
}
