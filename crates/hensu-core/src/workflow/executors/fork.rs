//! Fork node: launch independent branch chains that a later Join node
//! will wait on (§3, §4.2).
//!
//! Per §4.2, "Fork itself returns success immediately with bookkeeping
//! that the next Join awaits" — `ForkExecutor` spawns one branch task
//! per target and hands the handles to `ForkRegistry` rather than
//! blocking on them, so the blocking wait lives in `JoinExecutor`
//! instead.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::state::{HensuState, NodeResult};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{Node, NodeVariant, Workflow};
use crate::Result;

/// Branch tasks spawned by `ForkExecutor`, pending until the `Join`
/// node naming their target claims and awaits them. Keyed by
/// `(execution_id, target node id)` so concurrent executions sharing
/// one registry never collide.
#[derive(Default)]
pub struct ForkRegistry {
    pending: Mutex<HashMap<(Uuid, String), JoinHandle<NodeResult>>>,
}

impl ForkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, execution_id: Uuid, target: String, handle: JoinHandle<NodeResult>) {
        self.pending.lock().unwrap().insert((execution_id, target), handle);
    }

    /// Remove and await the branch task for `target` under `execution_id`.
    /// Returns `None` if no `Fork` ever spawned a branch for that target
    /// under this execution (e.g. a `Join` naming a target no `Fork`
    /// reached, or one already claimed by another `Join`).
    pub async fn take(&self, execution_id: Uuid, target: &str) -> Option<NodeResult> {
        let handle = self
            .pending
            .lock()
            .unwrap()
            .remove(&(execution_id, target.to_string()))?;
        match handle.await {
            Ok(result) => Some(result),
            Err(e) => Some(NodeResult::failure(format!("fork branch task panicked: {e}"))),
        }
    }
}

pub struct ForkExecutor;

#[async_trait]
impl NodeExecutor for ForkExecutor {
    async fn execute(
        &self,
        node: &Node,
        workflow: &Workflow,
        state: &mut HensuState,
        deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::Fork(f) => f,
            _ => unreachable!("ForkExecutor invoked on non-fork node"),
        };

        // A branch chain runs until it hits any other fork target
        // (shouldn't normally happen) or an End node; the controlling
        // Join decides when all branches have settled.
        let stop_nodes: HashSet<String> = HashSet::new();
        let execution_id = state.execution_id;

        for target in &spec.targets {
            let target_owned = target.clone();
            let workflow = workflow.clone();
            let branch_state = state.clone();
            let chain_runner = deps.chain_runner.clone();
            let stop = stop_nodes.clone();
            let cancellation = deps.cancellation.clone();

            let handle = tokio::spawn(async move {
                match chain_runner
                    .run_until(&target_owned, &stop, &workflow, branch_state, &cancellation)
                    .await
                {
                    Ok((_, result)) => result,
                    Err(e) => NodeResult::failure(e.to_string()),
                }
            });
            deps.fork_registry.insert(execution_id, target.clone(), handle);
        }

        let mut metadata = HashMap::new();
        metadata.insert(
            "fork_targets".to_string(),
            Value::Array(spec.targets.iter().cloned().map(Value::String).collect()),
        );

        Ok(NodeResult::success(
            format!("forked into {} branches", spec.targets.len()),
            metadata,
        ))
    }
}
