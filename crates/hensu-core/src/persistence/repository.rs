//! Persistence contracts: saving/loading execution snapshots and the
//! lease bookkeeping that lets multiple server nodes share a run queue
//! without double-driving the same execution (C10), plus storage for
//! `Workflow` definitions themselves.
//!
//! A SQL-backed implementation of `WorkflowStateRepository` would back
//! `list_stale`/`claim` with the partial indexes named in §4.11:
//! `(server_node_id, last_heartbeat_at) WHERE server_node_id IS NOT NULL`
//! for the sweep, and `(tenant_id) WHERE current_node_id IS NOT NULL`
//! for listing paused executions — so both scan O(active leases), not
//! O(all executions). `FsStateRepository` (the implementation shipped
//! here) doesn't need indexes since it lists a directory, but a
//! relational deployment should add them verbatim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::state::HensuSnapshot;
use crate::workflow::model::Workflow;
use crate::Result;

/// Ownership record for an in-flight execution. `server_node_id` and
/// `last_heartbeat_at` are both `None` once the run reaches a terminal
/// `CheckpointReason` — see `CheckpointReason::is_terminal`.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub tenant_id: String,
    pub execution_id: Uuid,
    pub server_node_id: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Storage for `HensuSnapshot`s plus the lease columns that drive crash
/// recovery. Implementations must make `claim` atomic with respect to
/// concurrent callers on other server nodes. Tenant isolation: a
/// lookup by `(tenant_id, execution_id)` must never return another
/// tenant's row (GLOSSARY "Tenant").
#[async_trait]
pub trait WorkflowStateRepository: Send + Sync {
    /// `snapshot.tenant_id` carries the isolation key; `owner` is this
    /// server node's id for the lease columns.
    async fn save(&self, snapshot: &HensuSnapshot, owner: &str) -> Result<()>;

    async fn load(&self, tenant_id: &str, execution_id: Uuid) -> Result<Option<HensuSnapshot>>;

    async fn heartbeat(&self, tenant_id: &str, execution_id: Uuid, owner: &str) -> Result<()>;

    /// List executions whose lease is non-terminal and whose
    /// `last_heartbeat_at` is older than `stale_before`, across every
    /// tenant — mirrors the tenant-agnostic `WHERE` clause in §4.11's
    /// sweep statement.
    async fn list_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<LeaseInfo>>;

    /// Atomically reassign a lease to `new_owner`, but only if it is
    /// still stale as of `stale_before` at the moment the write happens
    /// (mirrors the `WHERE ... last_heartbeat_at < :threshold` clause in
    /// §4.11's sweep statement). Returns `false` if another node already
    /// claimed it first — its refreshed `last_heartbeat_at` means this
    /// call observes the lease as no longer stale and skips it, the same
    /// outcome a second `UPDATE ... RETURNING` gets under read-committed
    /// isolation.
    async fn claim(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        new_owner: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    async fn release(&self, tenant_id: &str, execution_id: Uuid) -> Result<()>;
}

/// Storage for `Workflow` definitions themselves, tenant-scoped (§4.11
/// "WorkflowRepository"). The DSL/parser layer that produces `Workflow`
/// values is out of scope for this crate; this trait is only the
/// storage seam an embedder plugs a parser's output into.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save(&self, tenant_id: &str, workflow: &Workflow) -> Result<()>;

    async fn load(&self, tenant_id: &str, workflow_id: &str) -> Result<Option<Workflow>>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<Workflow>>;

    async fn delete(&self, tenant_id: &str, workflow_id: &str) -> Result<()>;
}
