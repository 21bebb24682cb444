//! Heartbeat loop and stale-lease sweeper built on top of
//! `WorkflowStateRepository` (C10).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::persistence::repository::WorkflowStateRepository;
use crate::Result;

/// Owns a background task that periodically refreshes an execution's
/// lease so other server nodes don't consider it stale and reclaim it
/// mid-run.
pub struct LeaseManager {
    handle: JoinHandle<()>,
}

impl LeaseManager {
    /// Spawn the heartbeat loop. Dropping the returned manager aborts it.
    pub fn spawn(
        repository: Arc<dyn WorkflowStateRepository>,
        tenant_id: String,
        execution_id: uuid::Uuid,
        owner: String,
        interval: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // A single heartbeat write racing a concurrent checkpoint is
            // transient, not fatal; retry a bounded number of times before
            // giving up the lease to a sweeper.
            let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(2));
            loop {
                ticker.tick().await;
                let mut last_err = None;
                for _ in 0..3 {
                    match repository.heartbeat(&tenant_id, execution_id, &owner).await {
                        Ok(()) => {
                            backoff.reset();
                            last_err = None;
                            break;
                        }
                        Err(e) => {
                            last_err = Some(e);
                            tokio::time::sleep(backoff.next_delay()).await;
                        }
                    }
                }
                if let Some(e) = last_err {
                    warn!(%execution_id, error = %e, "heartbeat failed, stopping lease manager");
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Scans for leases whose heartbeat is older than `stale_threshold` and
/// reclaims them under `owner`, returning `(tenant_id, execution_id)`
/// pairs so the caller can resume each from its last snapshot within
/// the right tenant scope.
pub async fn reclaim_stale_executions(
    repository: &dyn WorkflowStateRepository,
    stale_threshold: Duration,
    owner: &str,
) -> Result<Vec<(String, uuid::Uuid)>> {
    let cutoff = Utc::now() - chrono::Duration::from_std(stale_threshold).unwrap_or_default();
    let stale = repository.list_stale(cutoff).await?;
    let mut reclaimed = Vec::new();

    for lease in stale {
        let mut backoff = Backoff::new(Duration::from_millis(20), Duration::from_millis(500));
        let mut outcome = None;
        for attempt in 0..3 {
            match repository.claim(&lease.tenant_id, lease.execution_id, owner, cutoff).await {
                Ok(claimed) => {
                    outcome = Some(Ok(claimed));
                    break;
                }
                Err(_) if attempt < 2 => {
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(e) => outcome = Some(Err(e)),
            }
        }
        match outcome {
            Some(Ok(true)) => {
                info!(execution_id = %lease.execution_id, tenant_id = %lease.tenant_id, "reclaimed stale execution lease");
                reclaimed.push((lease.tenant_id, lease.execution_id));
            }
            Some(Ok(false)) => {}
            Some(Err(e)) => {
                warn!(execution_id = %lease.execution_id, error = %e, "failed to claim stale lease");
            }
            None => {}
        }
    }

    Ok(reclaimed)
}
