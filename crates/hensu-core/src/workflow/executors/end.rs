//! End node: a terminal marker. The engine short-circuits the pipeline
//! for End nodes entirely; this executor exists so `executor_for`
//! dispatch stays uniform.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::state::{HensuState, NodeResult};
use crate::workflow::executors::{ExecutorDeps, NodeExecutor};
use crate::workflow::model::{Node, NodeVariant, Workflow};
use crate::Result;

pub struct EndExecutor;

#[async_trait]
impl NodeExecutor for EndExecutor {
    async fn execute(
        &self,
        node: &Node,
        _workflow: &Workflow,
        _state: &mut HensuState,
        _deps: &ExecutorDeps,
    ) -> Result<NodeResult> {
        let spec = match &node.variant {
            NodeVariant::End(e) => e,
            _ => unreachable!("EndExecutor invoked on non-end node"),
        };
        Ok(NodeResult::success(format!("{:?}", spec.exit_status), HashMap::new()))
    }
}
