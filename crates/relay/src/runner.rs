// Per-workspace execution-container lease bookkeeping.
//
// The coordinator tracks which workspaces currently hold a live execution
// container. Container lifecycle (boot, shutdown) belongs to the execution
// host; the pool answers "does this workspace hold one" and keeps
// acquire/release idempotent so teardown can always release safely.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A granted container lease for one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLease {
    pub lease_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// Result of a lease release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Lease released.
    Released,
    /// No lease was held for this workspace.
    NotHeld,
}

/// In-memory lease table, owned by the coordinator and injected where
/// needed.
#[derive(Debug, Default)]
pub struct ContainerPool {
    leases: RwLock<HashMap<String, ContainerLease>>,
}

impl ContainerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a lease for the workspace, or returns the existing one
    /// (idempotent re-grant while the workspace stays loaded).
    pub async fn acquire(&self, workspace_id: &str) -> ContainerLease {
        let mut leases = self.leases.write().await;
        leases
            .entry(workspace_id.to_owned())
            .or_insert_with(|| ContainerLease {
                lease_id: Uuid::new_v4(),
                acquired_at: Utc::now(),
            })
            .clone()
    }

    /// Releases the workspace's lease during teardown.
    pub async fn release(&self, workspace_id: &str) -> ReleaseOutcome {
        match self.leases.write().await.remove(workspace_id) {
            Some(_) => ReleaseOutcome::Released,
            None => ReleaseOutcome::NotHeld,
        }
    }

    pub async fn held(&self, workspace_id: &str) -> bool {
        self.leases.read().await.contains_key(workspace_id)
    }
}
