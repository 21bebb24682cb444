use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hensu_core::action::{ActionExecutor, InProcessActionExecutor};
use hensu_core::agent::{AgentRegistry, StubAgentProvider};
use hensu_core::config::{self, HensuConfig};
use hensu_core::environment::{Environment, LeaseSettings};
use hensu_core::persistence::{FsStateRepository, WorkflowStateRepository};
use hensu_core::rubric::RubricEngine;
use hensu_core::workflow::engine::{EngineConfig, ExecutionResult, ExecutorBuilder};
use hensu_core::workflow::model::Workflow;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "hensu", version, about = "Run a Hensu workflow definition")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a fresh execution of a workflow definition.
    Start {
        /// Path to a JSON workflow definition.
        workflow: PathBuf,
        /// Path to a TOML runtime config (defaults applied if omitted).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory used to persist execution snapshots and leases.
        #[arg(long, default_value = ".hensu/state")]
        state_dir: PathBuf,
        /// Initial context as a JSON object.
        #[arg(long)]
        context: Option<String>,
        /// Isolation key under which the execution is persisted; a
        /// resume must name the same tenant to find it again.
        #[arg(long, default_value = "default")]
        tenant: String,
    },
    /// Resume a previously checkpointed execution by id.
    Resume {
        workflow: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".hensu/state")]
        state_dir: PathBuf,
        execution_id: Uuid,
        /// Tenant the execution was started under.
        #[arg(long, default_value = "default")]
        tenant: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    hensu_core::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            workflow,
            config,
            state_dir,
            context,
            tenant,
        } => {
            let (workflow, config) = load_inputs(&workflow, config.as_deref())?;
            let initial_context = match context {
                Some(raw) => {
                    serde_json::from_str(&raw).context("initial context must be a JSON object")?
                }
                None => HashMap::new(),
            };
            let environment = build_environment(workflow, &config, &state_dir)?;
            let result = environment.start(tenant, initial_context).await?;
            print_result(&result);
        }
        Command::Resume {
            workflow,
            config,
            state_dir,
            execution_id,
            tenant,
        } => {
            let (workflow, config) = load_inputs(&workflow, config.as_deref())?;
            let environment = build_environment(workflow, &config, &state_dir)?;
            let result = environment.resume(&tenant, execution_id).await?;
            print_result(&result);
        }
    }

    Ok(())
}

fn load_inputs(
    workflow_path: &std::path::Path,
    config_path: Option<&std::path::Path>,
) -> Result<(Workflow, HensuConfig)> {
    let data = std::fs::read_to_string(workflow_path)
        .with_context(|| format!("reading workflow file '{}'", workflow_path.display()))?;
    let workflow: Workflow = serde_json::from_str(&data).context("parsing workflow JSON")?;

    let config = match config_path {
        Some(path) => config::load_config(path)?,
        None => HensuConfig::default(),
    };

    Ok((workflow, config))
}

/// Wire up a demo `Environment`: a stub-only agent registry (real
/// deployments register their own `AgentProvider`s ahead of this call),
/// an in-process action executor with no handlers registered, and an
/// empty rubric set (workflows referencing a `rubric_id` should load
/// their `Rubric` definitions into `RubricEngine` before this point).
fn build_environment(
    workflow: Workflow,
    config: &HensuConfig,
    state_dir: &std::path::Path,
) -> Result<Environment> {
    let agents = Arc::new(AgentRegistry::new());
    agents.register_provider(Arc::new(StubAgentProvider));
    let rubrics = Arc::new(RubricEngine::new(HashMap::new()));
    let actions: Arc<dyn ActionExecutor> = Arc::new(InProcessActionExecutor::new());

    let engine_config = EngineConfig {
        max_execution_steps: config.runtime.max_execution_steps,
        server_node_id: "cli".to_string(),
        ..EngineConfig::default()
    };

    let executor = ExecutorBuilder::new(workflow, agents, rubrics, actions)
        .with_config(engine_config)
        .build()?;

    let repository: Arc<dyn WorkflowStateRepository> = Arc::new(FsStateRepository::new(state_dir));

    let lease = LeaseSettings {
        heartbeat_interval: Duration::from_secs(config.lease.heartbeat_interval_seconds),
        stale_threshold: Duration::from_secs(config.lease.lease_stale_threshold_seconds),
    };

    Ok(Environment::new(executor)
        .with_repository(repository)
        .with_owner("cli")
        .with_lease_settings(lease))
}

fn print_result(result: &ExecutionResult) {
    match result {
        ExecutionResult::Completed { snapshot, exit_status } => {
            println!(
                "completed: execution={} exit_status={:?}",
                snapshot.execution_id, exit_status
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot.context).unwrap()
            );
        }
        ExecutionResult::Paused { snapshot, node_id, reason } => {
            println!(
                "paused: execution={} node={node_id} reason={reason}",
                snapshot.execution_id
            );
        }
        ExecutionResult::Rejected { snapshot, node_id, reason } => {
            println!(
                "rejected: execution={} node={node_id} reason={reason}",
                snapshot.execution_id
            );
        }
        ExecutionResult::Failed { snapshot, node_id, error } => {
            println!(
                "failed: execution={} node={node_id} error={error}",
                snapshot.execution_id
            );
        }
    }
}
