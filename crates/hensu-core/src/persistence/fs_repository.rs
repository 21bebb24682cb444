//! Filesystem-backed `WorkflowStateRepository` and `WorkflowRepository`,
//! one JSON snapshot file plus one lease sidecar file per execution
//! (scoped under a per-tenant subdirectory), mirroring the
//! `recovery.json`-per-run layout this engine's checkpointing is
//! grounded on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::persistence::repository::{LeaseInfo, WorkflowRepository, WorkflowStateRepository};
use crate::state::HensuSnapshot;
use crate::workflow::model::Workflow;
use crate::{HensuError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    tenant_id: String,
    execution_id: Uuid,
    server_node_id: Option<String>,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

fn sanitize_tenant(tenant_id: &str) -> &str {
    if tenant_id.is_empty() {
        crate::state::DEFAULT_TENANT_ID
    } else {
        tenant_id
    }
}

/// Stores one `<tenant_id>/<execution_id>.snapshot.json` and one
/// `<tenant_id>/<execution_id>.lease.json` per execution under
/// `base_dir`. The in-process mutex serializes lease read-modify-write
/// so `claim` is atomic for a single server node; a multi-node
/// deployment would replace this with a database's `UPDATE ...
/// RETURNING`.
pub struct FsStateRepository {
    base_dir: PathBuf,
    lease_lock: Mutex<()>,
}

impl FsStateRepository {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            lease_lock: Mutex::new(()),
        }
    }

    fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.base_dir.join(sanitize_tenant(tenant_id))
    }

    fn snapshot_path(&self, tenant_id: &str, execution_id: Uuid) -> PathBuf {
        self.tenant_dir(tenant_id)
            .join(format!("{execution_id}.snapshot.json"))
    }

    fn lease_path(&self, tenant_id: &str, execution_id: Uuid) -> PathBuf {
        self.tenant_dir(tenant_id)
            .join(format!("{execution_id}.lease.json"))
    }

    async fn ensure_dir(&self, tenant_id: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.tenant_dir(tenant_id)).await?;
        Ok(())
    }

    async fn read_lease(&self, path: &Path) -> Result<Option<LeaseRecord>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn write_lease(&self, path: &Path, record: &LeaseRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Walk every tenant subdirectory under `base_dir`, collecting
    /// `*.lease.json` paths. `list_stale` sweeps across tenants (§4.11's
    /// sweep statement carries no tenant filter), so this crosses the
    /// per-tenant directory boundary that every other read/write here
    /// respects.
    async fn list_lease_files(&self) -> Result<Vec<PathBuf>> {
        if !self.base_dir.exists() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        let mut tenant_entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(tenant_entry) = tenant_entries.next_entry().await? {
            let tenant_path = tenant_entry.path();
            if !tenant_path.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(&tenant_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.to_string_lossy().ends_with(".lease.json") {
                    out.push(path);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl WorkflowStateRepository for FsStateRepository {
    async fn save(&self, snapshot: &HensuSnapshot, owner: &str) -> Result<()> {
        let tenant_id = sanitize_tenant(&snapshot.tenant_id).to_string();
        self.ensure_dir(&tenant_id).await?;
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(self.snapshot_path(&tenant_id, snapshot.execution_id), json).await?;

        let _guard = self.lease_lock.lock().await;
        let terminal = snapshot.checkpoint_reason.is_terminal();
        let record = LeaseRecord {
            tenant_id: tenant_id.clone(),
            execution_id: snapshot.execution_id,
            server_node_id: if terminal { None } else { Some(owner.to_string()) },
            last_heartbeat_at: if terminal { None } else { Some(Utc::now()) },
        };
        self.write_lease(&self.lease_path(&tenant_id, snapshot.execution_id), &record)
            .await?;
        Ok(())
    }

    async fn load(&self, tenant_id: &str, execution_id: Uuid) -> Result<Option<HensuSnapshot>> {
        let path = self.snapshot_path(tenant_id, execution_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn heartbeat(&self, tenant_id: &str, execution_id: Uuid, owner: &str) -> Result<()> {
        let _guard = self.lease_lock.lock().await;
        let path = self.lease_path(tenant_id, execution_id);
        let mut record = self
            .read_lease(&path)
            .await?
            .ok_or_else(|| HensuError::LeaseLost(execution_id.to_string()))?;

        if record.server_node_id.as_deref() != Some(owner) {
            return Err(HensuError::LeaseLost(format!(
                "execution {execution_id} is owned by a different server node"
            )));
        }
        record.last_heartbeat_at = Some(Utc::now());
        self.write_lease(&path, &record).await
    }

    async fn list_stale(&self, stale_before: DateTime<Utc>) -> Result<Vec<LeaseInfo>> {
        let _guard = self.lease_lock.lock().await;
        let mut stale = Vec::new();
        for path in self.list_lease_files().await? {
            if let Some(record) = self.read_lease(&path).await? {
                let is_stale = record
                    .last_heartbeat_at
                    .is_some_and(|hb| hb < stale_before);
                if is_stale {
                    stale.push(LeaseInfo {
                        tenant_id: record.tenant_id,
                        execution_id: record.execution_id,
                        server_node_id: record.server_node_id,
                        last_heartbeat_at: record.last_heartbeat_at,
                    });
                }
            }
        }
        Ok(stale)
    }

    async fn claim(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        new_owner: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.lease_lock.lock().await;
        let path = self.lease_path(tenant_id, execution_id);
        let existing = self.read_lease(&path).await?;

        // Re-check staleness under the lock so two racing sweepers can't
        // both win the same lease: a lease another sweeper already
        // reclaimed has a fresh `last_heartbeat_at` and is no longer
        // older than `stale_before`, so this call sees that and skips.
        let still_stale = existing.as_ref().is_some_and(|record| {
            record.server_node_id.is_some()
                && record.last_heartbeat_at.is_some_and(|hb| hb < stale_before)
        });
        if !still_stale {
            return Ok(false);
        }

        let record = LeaseRecord {
            tenant_id: sanitize_tenant(tenant_id).to_string(),
            execution_id,
            server_node_id: Some(new_owner.to_string()),
            last_heartbeat_at: Some(Utc::now()),
        };
        self.write_lease(&path, &record).await?;
        Ok(true)
    }

    async fn release(&self, tenant_id: &str, execution_id: Uuid) -> Result<()> {
        let _guard = self.lease_lock.lock().await;
        let record = LeaseRecord {
            tenant_id: sanitize_tenant(tenant_id).to_string(),
            execution_id,
            server_node_id: None,
            last_heartbeat_at: None,
        };
        self.write_lease(&self.lease_path(tenant_id, execution_id), &record)
            .await
    }
}

pub type SharedStateRepository = Arc<dyn WorkflowStateRepository>;

/// Stores one `<tenant_id>/<workflow_id>.json` `Workflow` definition per
/// file under `base_dir`, a sibling layout to `FsStateRepository`'s
/// snapshot storage but its own root so workflow definitions and
/// in-flight execution state can be backed up or migrated separately.
pub struct FsWorkflowRepository {
    base_dir: PathBuf,
}

impl FsWorkflowRepository {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.base_dir.join(sanitize_tenant(tenant_id))
    }

    fn workflow_path(&self, tenant_id: &str, workflow_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join(format!("{workflow_id}.json"))
    }
}

#[async_trait]
impl WorkflowRepository for FsWorkflowRepository {
    async fn save(&self, tenant_id: &str, workflow: &Workflow) -> Result<()> {
        tokio::fs::create_dir_all(self.tenant_dir(tenant_id)).await?;
        let json = serde_json::to_string_pretty(workflow)?;
        tokio::fs::write(self.workflow_path(tenant_id, &workflow.id), json).await?;
        Ok(())
    }

    async fn load(&self, tenant_id: &str, workflow_id: &str) -> Result<Option<Workflow>> {
        let path = self.workflow_path(tenant_id, workflow_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<Workflow>> {
        let dir = self.tenant_dir(tenant_id);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                let data = tokio::fs::read_to_string(&path).await?;
                out.push(serde_json::from_str(&data)?);
            }
        }
        Ok(out)
    }

    async fn delete(&self, tenant_id: &str, workflow_id: &str) -> Result<()> {
        let path = self.workflow_path(tenant_id, workflow_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CheckpointReason, HensuState};
    use std::collections::HashMap;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FsStateRepository::new(tmp.path());
        let state = HensuState::new("wf", "start", HashMap::new());
        let snapshot = state.snapshot(CheckpointReason::Checkpoint);
        let execution_id = snapshot.execution_id;

        repo.save(&snapshot, "node-a").await.unwrap();
        let loaded = repo
            .load(&snapshot.tenant_id, execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.execution_id, execution_id);
    }

    #[tokio::test]
    async fn terminal_checkpoint_clears_lease() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FsStateRepository::new(tmp.path());
        let state = HensuState::new("wf", "start", HashMap::new());
        let snapshot = state.snapshot(CheckpointReason::Completed);
        repo.save(&snapshot, "node-a").await.unwrap();

        let err = repo
            .heartbeat(&snapshot.tenant_id, snapshot.execution_id, "node-a")
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn stale_lease_is_claimable() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FsStateRepository::new(tmp.path());
        let state = HensuState::new("wf", "start", HashMap::new());
        let snapshot = state.snapshot(CheckpointReason::Checkpoint);
        repo.save(&snapshot, "node-a").await.unwrap();

        let future = Utc::now() + chrono::Duration::seconds(1);
        let stale = repo.list_stale(future).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].tenant_id, snapshot.tenant_id);

        let claimed = repo
            .claim(&snapshot.tenant_id, snapshot.execution_id, "node-b", future)
            .await
            .unwrap();
        assert!(claimed);
        repo.heartbeat(&snapshot.tenant_id, snapshot.execution_id, "node-b")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_racing_claim_on_the_same_lease_loses() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FsStateRepository::new(tmp.path());
        let state = HensuState::new("wf", "start", HashMap::new());
        let snapshot = state.snapshot(CheckpointReason::Checkpoint);
        repo.save(&snapshot, "node-a").await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        let first = repo
            .claim(&snapshot.tenant_id, snapshot.execution_id, "node-b", cutoff)
            .await
            .unwrap();
        assert!(first, "first sweeper should win the stale lease");

        // The second sweeper observed the same stale threshold but runs
        // after `node-b` already refreshed the heartbeat, so it must not
        // also win.
        let second = repo
            .claim(&snapshot.tenant_id, snapshot.execution_id, "node-c", cutoff)
            .await
            .unwrap();
        assert!(!second, "second sweeper must see the refreshed heartbeat and skip");
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_others_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = FsStateRepository::new(tmp.path());
        let state = HensuState::new("wf", "start", HashMap::new()).with_tenant("acme");
        let snapshot = state.snapshot(CheckpointReason::Checkpoint);
        repo.save(&snapshot, "node-a").await.unwrap();

        let cross_tenant = repo.load("other-tenant", snapshot.execution_id).await.unwrap();
        assert!(cross_tenant.is_none());

        let same_tenant = repo.load("acme", snapshot.execution_id).await.unwrap();
        assert!(same_tenant.is_some());
    }

    #[tokio::test]
    async fn workflow_repository_round_trips_per_tenant() {
        use crate::review::ReviewConfig;
        use crate::workflow::model::{
            EndNode, ExitStatus, Node, NodeVariant, Workflow, WorkflowConfig, WorkflowMetadata,
        };

        let tmp = tempfile::tempdir().unwrap();
        let repo = FsWorkflowRepository::new(tmp.path());
        let mut nodes = HashMap::new();
        nodes.insert(
            "end".to_string(),
            Node {
                id: "end".into(),
                variant: NodeVariant::End(EndNode { exit_status: ExitStatus::Success }),
                transition_rules: vec![],
                rubric_id: None,
                review: ReviewConfig::default(),
            },
        );
        let workflow = Workflow {
            id: "wf-1".into(),
            version: "1.0.0".into(),
            start_node_id: "end".into(),
            agents: HashMap::new(),
            rubrics: HashMap::new(),
            nodes,
            metadata: WorkflowMetadata::default(),
            config: WorkflowConfig::default(),
        };

        repo.save("acme", &workflow).await.unwrap();
        assert!(repo.load("other-tenant", "wf-1").await.unwrap().is_none());
        let loaded = repo.load("acme", "wf-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, "wf-1");
        assert_eq!(repo.list("acme").await.unwrap().len(), 1);

        repo.delete("acme", "wf-1").await.unwrap();
        assert!(repo.load("acme", "wf-1").await.unwrap().is_none());
    }
}
