//! Distributed state persistence: snapshot storage plus lease-based
//! crash recovery (C10).

pub mod fs_repository;
pub mod lease;
pub mod repository;

pub use fs_repository::{FsStateRepository, FsWorkflowRepository, SharedStateRepository};
pub use lease::{reclaim_stale_executions, LeaseManager};
pub use repository::{LeaseInfo, WorkflowRepository, WorkflowStateRepository};
