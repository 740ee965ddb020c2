// Tears down workspaces whose owner has been absent for the grace window.
//
// The registry reports each owner departure together with a drain epoch; the
// reaper arms one timer per departure. A reconnecting owner bumps the epoch,
// which turns the pending timer into a no-op before it ever touches the
// teardown lock. A timer that survives the grace window acquires the
// workspace's lock and re-validates through `begin_teardown`, so the
// "count is zero, safe to tear down" invariant is established inside the
// critical section rather than assumed from the earlier unlocked read.

use std::sync::Arc;
use std::time::Duration;

use sandpit_common::protocol::ws::WsMessage;
use tracing::{debug, info};

use crate::lock::LockManager;
use crate::registry::WorkspaceRegistry;
use crate::runner::ContainerPool;

/// Result of one teardown attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// The drain was cancelled before the timer fired; the teardown lock was
    /// never requested.
    Cancelled,
    /// The runtime state was evicted and the container lease released.
    Evicted,
    /// Another actor resolved the workspace first (reconnection inside the
    /// lock wait, or a competing teardown).
    Superseded,
}

#[derive(Clone)]
pub struct InactivityReaper {
    registry: Arc<WorkspaceRegistry>,
    locks: LockManager,
    containers: Arc<ContainerPool>,
    grace: Duration,
}

impl InactivityReaper {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        locks: LockManager,
        containers: Arc<ContainerPool>,
        grace: Duration,
    ) -> Self {
        Self { registry, locks, containers, grace }
    }

    /// Arms the grace timer for a workspace whose owner count just reached
    /// zero.
    pub fn arm(&self, workspace_id: String, drain_epoch: u64) {
        debug!(
            workspace_id = %workspace_id,
            drain_epoch,
            grace_secs = self.grace.as_secs(),
            "owner departed, arming teardown timer",
        );
        let reaper = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(reaper.grace).await;
            reaper.reap(&workspace_id, drain_epoch).await;
        });
    }

    /// Runs one teardown attempt for an expired timer.
    pub(crate) async fn reap(&self, workspace_id: &str, drain_epoch: u64) -> ReapOutcome {
        // A cancelled drain never reaches the lock manager.
        if !self.registry.is_draining(workspace_id, drain_epoch).await {
            debug!(workspace_id = %workspace_id, drain_epoch, "drain cancelled, skipping teardown");
            return ReapOutcome::Cancelled;
        }

        let _guard = self.locks.acquire(workspace_id).await;

        match self.registry.begin_teardown(workspace_id, drain_epoch).await {
            Some(evicted) => {
                let lease = self.containers.release(workspace_id).await;
                for outbound in &evicted.attached {
                    let _ = outbound.send(WsMessage::DisableAccess {
                        reason: "The playground owner has disconnected.".to_owned(),
                    });
                }
                info!(
                    workspace_id = %workspace_id,
                    cached_files = evicted.cached_files,
                    remaining_sessions = evicted.attached.len(),
                    container_lease = ?lease,
                    "workspace torn down after owner inactivity",
                );
                ReapOutcome::Evicted
            }
            None => {
                debug!(
                    workspace_id = %workspace_id,
                    drain_epoch,
                    "teardown superseded inside the critical section",
                );
                ReapOutcome::Superseded
            }
        }
    }
}
