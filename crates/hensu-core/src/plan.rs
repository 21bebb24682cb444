//! Plan engine: step-by-step tool invocation sub-state-machine (C7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::action::{ActionExecutor, ActionInvocation};
use crate::registry::TemplateResolver;
use crate::{HensuError, Result};

/// Status of one step within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A single planned tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedStep {
    pub index: u32,
    pub tool_name: String,
    pub arguments: HashMap<String, Value>,
    pub description: String,
    pub status: StepStatus,
}

/// Where a plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    Static,
    LlmGenerated,
}

/// An ordered sequence of tool invocations produced either statically
/// or by a planner agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub origin: PlanOrigin,
    pub steps: Vec<PlannedStep>,
    pub revisions: u32,
}

impl Plan {
    pub fn new(origin: PlanOrigin, steps: Vec<PlannedStep>) -> Self {
        Self {
            origin,
            steps,
            revisions: 0,
        }
    }

    pub fn first_pending_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status == StepStatus::Pending)
    }
}

/// Immutable snapshot of in-flight plan state, embedded on
/// `HensuState::active_plan` while a plan is executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan: Plan,
    pub results: Vec<StepResult>,
}

/// Outcome of executing one planned step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: u32,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Constraints bounding a plan's execution.
#[derive(Debug, Clone, Copy)]
pub struct PlanConstraints {
    pub max_steps: u32,
    pub max_replans: u32,
    pub timeout: Duration,
}

impl Default for PlanConstraints {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_replans: 3,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Reason the enclosing `PlannedStep` failed, passed to
/// `Planner::revise`.
#[derive(Debug, Clone)]
pub struct ReviseRequest {
    pub failed_at_step: u32,
    pub reason: String,
}

/// External collaborator that can produce and revise plans. The
/// concrete LLM-backed implementation lives outside the core.
#[async_trait]
pub trait Planner: Send + Sync {
    fn supports_revision(&self) -> bool {
        false
    }

    async fn revise(&self, current: &Plan, request: ReviseRequest) -> Result<Plan>;
}

/// Observer callbacks fired during plan execution (§4.7, §6).
pub trait PlanObserver: Send + Sync {
    fn on_plan_created(&self, _plan: &Plan) {}
    fn on_step_started(&self, _step: &PlannedStep) {}
    fn on_step_completed(&self, _step: &PlannedStep, _result: &StepResult) {}
    fn on_plan_revised(&self, _plan: &Plan) {}
    fn on_plan_completed(&self, _success: bool) {}
    fn on_plan_paused(&self) {}
}

/// No-op observer used when the caller doesn't care about plan events.
pub struct NullPlanObserver;
impl PlanObserver for NullPlanObserver {}

/// Outcome of running a plan to completion (or pausing for review).
pub enum PlanOutcome {
    Completed { success: bool, output: Option<Value> },
    Paused(PlanSnapshot),
}

/// Sub-state-machine that drives a `Plan` to completion, dispatching
/// each step through the `ActionExecutor` and consulting the `Planner`
/// for revisions on failure.
pub struct PlanExecutor<'a> {
    action_executor: &'a dyn ActionExecutor,
    planner: Option<&'a dyn Planner>,
    observer: &'a dyn PlanObserver,
    resolver: &'a TemplateResolver,
    constraints: PlanConstraints,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(
        action_executor: &'a dyn ActionExecutor,
        observer: &'a dyn PlanObserver,
        resolver: &'a TemplateResolver,
        constraints: PlanConstraints,
    ) -> Self {
        Self {
            action_executor,
            planner: None,
            observer,
            resolver,
            constraints,
        }
    }

    pub fn with_planner(mut self, planner: &'a dyn Planner) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Whether a review config targeting plans requires suspension
    /// immediately after plan creation. Callers that need this behavior
    /// pass `suspend_for_review = true`.
    pub async fn run(
        &self,
        mut plan: Plan,
        context: &HashMap<String, Value>,
        suspend_for_review: bool,
    ) -> Result<PlanOutcome> {
        if plan.steps.len() as u32 > self.constraints.max_steps {
            warn!(
                steps = plan.steps.len(),
                max = self.constraints.max_steps,
                "truncating plan to max_steps"
            );
            plan.steps.truncate(self.constraints.max_steps as usize);
        }

        self.observer.on_plan_created(&plan);

        if suspend_for_review {
            self.observer.on_plan_paused();
            return Ok(PlanOutcome::Paused(PlanSnapshot {
                plan,
                results: Vec::new(),
            }));
        }

        let mut results: Vec<StepResult> = Vec::new();
        let start = Instant::now();

        loop {
            let Some(idx) = plan.first_pending_index() else {
                let success = results.iter().all(|r| r.success);
                let output = results.last().and_then(|r| r.output.clone());
                self.observer.on_plan_completed(success);
                return Ok(PlanOutcome::Completed { success, output });
            };

            if start.elapsed() > self.constraints.timeout {
                return Err(HensuError::StepTimeout(format!(
                    "plan exceeded timeout of {:?}",
                    self.constraints.timeout
                )));
            }

            plan.steps[idx].status = StepStatus::Running;
            self.observer.on_step_started(&plan.steps[idx]);

            let step_start = Instant::now();
            let step = plan.steps[idx].clone();
            let resolved_args = self.resolve_arguments(&step.arguments, context);

            let invocation = ActionInvocation {
                handler_id: step.tool_name.clone(),
                payload: resolved_args,
            };

            let outcome = self.action_executor.execute(&invocation).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            let step_result = match outcome {
                Ok(value) => StepResult {
                    step_index: step.index,
                    success: true,
                    output: Some(value),
                    error: None,
                    duration_ms,
                },
                Err(e) => StepResult {
                    step_index: step.index,
                    success: false,
                    output: None,
                    error: Some(e.to_string()),
                    duration_ms,
                },
            };

            plan.steps[idx].status = if step_result.success {
                StepStatus::Succeeded
            } else {
                StepStatus::Failed
            };
            self.observer
                .on_step_completed(&plan.steps[idx], &step_result);

            let succeeded = step_result.success;
            let reason = step_result.error.clone();
            results.push(step_result);

            if !succeeded {
                if let Some(planner) = self.planner {
                    if planner.supports_revision() && plan.revisions < self.constraints.max_replans
                    {
                        let revised = planner
                            .revise(
                                &plan,
                                ReviseRequest {
                                    failed_at_step: step.index,
                                    reason: reason.unwrap_or_default(),
                                },
                            )
                            .await?;
                        plan = revised;
                        plan.revisions += 1;
                        self.observer.on_plan_revised(&plan);
                        continue;
                    }
                }
                self.observer.on_plan_completed(false);
                return Ok(PlanOutcome::Completed {
                    success: false,
                    output: None,
                });
            }
        }
    }

    fn resolve_arguments(
        &self,
        arguments: &HashMap<String, Value>,
        context: &HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        arguments
            .iter()
            .map(|(k, v)| {
                let resolved = match v {
                    Value::String(s) => Value::String(self.resolver.resolve(s, context)),
                    other => other.clone(),
                };
                (k.clone(), resolved)
            })
            .collect()
    }
}

/// Builds a static plan from a block of pre-declared steps.
pub fn static_plan(steps: Vec<(String, HashMap<String, Value>, String)>) -> Plan {
    let steps = steps
        .into_iter()
        .enumerate()
        .map(|(i, (tool_name, arguments, description))| PlannedStep {
            index: i as u32,
            tool_name,
            arguments,
            description,
            status: StepStatus::Pending,
        })
        .collect();
    Plan::new(PlanOrigin::Static, steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::InProcessActionExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn step(tool: &str) -> PlannedStep {
        PlannedStep {
            index: 0,
            tool_name: tool.into(),
            arguments: HashMap::new(),
            description: String::new(),
            status: StepStatus::Pending,
        }
    }

    #[tokio::test]
    async fn runs_all_steps_to_completion() {
        let mut executor = InProcessActionExecutor::new();
        executor.register("noop", |_| Ok(Value::String("ok".into())));

        let resolver = TemplateResolver;
        let plan = static_plan(vec![
            ("noop".into(), HashMap::new(), "first".into()),
            ("noop".into(), HashMap::new(), "second".into()),
        ]);

        let runner = PlanExecutor::new(&executor, &NullPlanObserver, &resolver, PlanConstraints::default());
        let outcome = runner.run(plan, &HashMap::new(), false).await.unwrap();
        match outcome {
            PlanOutcome::Completed { success, .. } => assert!(success),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn failed_step_without_planner_fails_plan() {
        let mut executor = InProcessActionExecutor::new();
        executor.register("boom", |_| Err(HensuError::ActionExecutionError("nope".into())));

        let resolver = TemplateResolver;
        let plan = static_plan(vec![("boom".into(), HashMap::new(), "x".into())]);
        let runner = PlanExecutor::new(&executor, &NullPlanObserver, &resolver, PlanConstraints::default());
        let outcome = runner.run(plan, &HashMap::new(), false).await.unwrap();
        match outcome {
            PlanOutcome::Completed { success, .. } => assert!(!success),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn pauses_for_review_when_requested() {
        let executor = InProcessActionExecutor::new();
        let resolver = TemplateResolver;
        let plan = static_plan(vec![("noop".into(), HashMap::new(), "x".into())]);
        let runner = PlanExecutor::new(&executor, &NullPlanObserver, &resolver, PlanConstraints::default());
        let outcome = runner.run(plan, &HashMap::new(), true).await.unwrap();
        assert!(matches!(outcome, PlanOutcome::Paused(_)));
    }

    #[tokio::test]
    async fn revision_resumes_from_failed_step() {
        struct CountingPlanner {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Planner for CountingPlanner {
            fn supports_revision(&self) -> bool {
                true
            }
            async fn revise(&self, _current: &Plan, _req: ReviseRequest) -> Result<Plan> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(static_plan(vec![("noop".into(), HashMap::new(), "fixed".into())]))
            }
        }

        let mut executor = InProcessActionExecutor::new();
        executor.register("boom", |_| Err(HensuError::ActionExecutionError("nope".into())));
        executor.register("noop", |_| Ok(Value::String("ok".into())));

        let resolver = TemplateResolver;
        let plan = static_plan(vec![("boom".into(), HashMap::new(), "x".into())]);
        let planner = CountingPlanner {
            calls: AtomicUsize::new(0),
        };
        let runner = PlanExecutor::new(&executor, &NullPlanObserver, &resolver, PlanConstraints::default())
            .with_planner(&planner);
        let outcome = runner.run(plan, &HashMap::new(), false).await.unwrap();
        match outcome {
            PlanOutcome::Completed { success, .. } => assert!(success),
            _ => panic!("expected completion"),
        }
        assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn static_plan_builds_pending_steps() {
        let plan = static_plan(vec![("t".into(), HashMap::new(), "d".into())]);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
        let _ = step("t");
    }
}
