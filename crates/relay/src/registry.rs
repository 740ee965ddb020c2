// Per-workspace presence tracking and runtime state.
//
// One `WorkspaceRuntime` exists per workspace with at least one admitted
// session (or one still inside its drain grace window). Every mutation runs
// under a single write-lock section with no internal await, so each is
// atomic with respect to every other registry operation; sequences that span
// an await (teardown) re-validate through `begin_teardown`.

use std::collections::HashMap;

use sandpit_common::{protocol::ws::WsMessage, types::PlaygroundFiles};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Lifecycle phase of a loaded workspace. A workspace with no registry entry
/// is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspacePhase {
    /// First admission arrived; the file cache is not installed yet.
    Loading,
    /// File cache installed, owner present (or was present).
    Active,
    /// Owner count dropped to zero; the grace timer is running.
    Draining,
}

#[derive(Debug)]
struct WorkspaceRuntime {
    owner_connections: usize,
    guest_connections: usize,
    owner_connected: bool,
    phase: WorkspacePhase,
    /// Bumped whenever a drain starts or is cancelled; a pending teardown
    /// timer is only valid for the epoch it was armed with.
    drain_epoch: u64,
    files: Option<PlaygroundFiles>,
    /// Outbound frame senders of currently attached sessions.
    attached: HashMap<Uuid, mpsc::UnboundedSender<WsMessage>>,
}

impl WorkspaceRuntime {
    fn new() -> Self {
        Self {
            owner_connections: 0,
            guest_connections: 0,
            owner_connected: false,
            phase: WorkspacePhase::Loading,
            drain_epoch: 0,
            files: None,
            attached: HashMap::new(),
        }
    }
}

/// Outcome of an owner admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerAdmission {
    /// This admission created the workspace runtime.
    pub first_for_workspace: bool,
    /// This admission cancelled a pending drain.
    pub drain_cancelled: bool,
}

/// The owner count reached zero; the workspace entered `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerDeparture {
    /// Epoch the reaper must present to act on this departure.
    pub drain_epoch: u64,
}

/// State removed from the registry by a successful teardown.
#[derive(Debug)]
pub struct EvictedWorkspace {
    /// Outbound senders of sessions still attached (guests, by invariant:
    /// teardown only proceeds with zero owner connections).
    pub attached: Vec<mpsc::UnboundedSender<WsMessage>>,
    /// Number of files that were cached.
    pub cached_files: usize,
}

/// Registry of live workspace runtime state, owned by the coordinator and
/// injected wherever presence or cache access is needed.
#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    workspaces: RwLock<HashMap<String, WorkspaceRuntime>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an owner connection: creates the runtime on first contact,
    /// increments the owner count, and cancels a pending drain.
    pub async fn admit_owner(
        &self,
        workspace_id: &str,
        session_id: Uuid,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) -> OwnerAdmission {
        let mut workspaces = self.workspaces.write().await;
        let first_for_workspace = !workspaces.contains_key(workspace_id);
        let runtime = workspaces.entry(workspace_id.to_owned()).or_insert_with(WorkspaceRuntime::new);

        runtime.owner_connections += 1;
        runtime.owner_connected = true;
        runtime.attached.insert(session_id, outbound);

        let drain_cancelled = runtime.phase == WorkspacePhase::Draining;
        if drain_cancelled {
            // Invalidate the pending teardown timer.
            runtime.phase = WorkspacePhase::Active;
            runtime.drain_epoch += 1;
        }

        OwnerAdmission { first_for_workspace, drain_cancelled }
    }

    /// Admits a guest connection iff the owner is connected at this instant.
    /// Guests never create runtime state.
    pub async fn admit_guest(
        &self,
        workspace_id: &str,
        session_id: Uuid,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) -> bool {
        let mut workspaces = self.workspaces.write().await;
        match workspaces.get_mut(workspace_id) {
            Some(runtime) if runtime.owner_connected => {
                runtime.guest_connections += 1;
                runtime.attached.insert(session_id, outbound);
                true
            }
            _ => false,
        }
    }

    /// Removes a session. For owners, reports the departure that drops the
    /// count to zero so the caller can arm the inactivity reaper.
    pub async fn disconnect(
        &self,
        workspace_id: &str,
        session_id: Uuid,
        is_owner: bool,
    ) -> Option<OwnerDeparture> {
        let mut workspaces = self.workspaces.write().await;
        let runtime = workspaces.get_mut(workspace_id)?;
        runtime.attached.remove(&session_id);

        if is_owner {
            runtime.owner_connections = runtime.owner_connections.saturating_sub(1);
            if runtime.owner_connections == 0 && runtime.owner_connected {
                runtime.owner_connected = false;
                runtime.phase = WorkspacePhase::Draining;
                runtime.drain_epoch += 1;
                return Some(OwnerDeparture { drain_epoch: runtime.drain_epoch });
            }
        } else {
            runtime.guest_connections = runtime.guest_connections.saturating_sub(1);
        }

        None
    }

    /// Atomically re-checks a pending teardown and evicts the runtime when
    /// it is still warranted: the workspace must still be draining under the
    /// same epoch with zero owner connections. A reconnection that landed
    /// first flipped the phase or epoch, and the teardown yields `None`.
    pub async fn begin_teardown(
        &self,
        workspace_id: &str,
        drain_epoch: u64,
    ) -> Option<EvictedWorkspace> {
        let mut workspaces = self.workspaces.write().await;
        let runtime = workspaces.get(workspace_id)?;

        let still_warranted = runtime.phase == WorkspacePhase::Draining
            && runtime.drain_epoch == drain_epoch
            && runtime.owner_connections == 0;
        if !still_warranted {
            return None;
        }

        let runtime = workspaces.remove(workspace_id)?;
        Some(EvictedWorkspace {
            attached: runtime.attached.into_values().collect(),
            cached_files: runtime.files.map(|files| files.len()).unwrap_or(0),
        })
    }

    /// Installs the loaded file cache, first writer wins; moves
    /// `Loading -> Active`. Returns the effective cache, or `None` when the
    /// workspace was evicted while its files were being fetched.
    pub async fn install_files(
        &self,
        workspace_id: &str,
        files: PlaygroundFiles,
    ) -> Option<PlaygroundFiles> {
        let mut workspaces = self.workspaces.write().await;
        let runtime = workspaces.get_mut(workspace_id)?;
        if runtime.files.is_none() {
            runtime.files = Some(files);
            if runtime.phase == WorkspacePhase::Loading {
                runtime.phase = WorkspacePhase::Active;
            }
        }
        runtime.files.clone()
    }

    /// The currently installed file cache, if any.
    pub async fn files(&self, workspace_id: &str) -> Option<PlaygroundFiles> {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .and_then(|runtime| runtime.files.clone())
    }

    /// Replaces (or inserts) one file's content in the cache. The new
    /// content is visible to every session of the workspace as soon as the
    /// write lock is released. Returns false when the workspace is not
    /// loaded.
    pub async fn upsert_file(&self, workspace_id: &str, file_id: &str, content: String) -> bool {
        let mut workspaces = self.workspaces.write().await;
        let Some(runtime) = workspaces.get_mut(workspace_id) else {
            return false;
        };
        let Some(files) = runtime.files.as_mut() else {
            return false;
        };
        if !files.files_data.contains_key(file_id) {
            files.files.push(file_id.to_owned());
        }
        files.files_data.insert(file_id.to_owned(), content);
        true
    }

    pub async fn owner_connected(&self, workspace_id: &str) -> bool {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .map(|runtime| runtime.owner_connected)
            .unwrap_or(false)
    }

    pub async fn phase(&self, workspace_id: &str) -> Option<WorkspacePhase> {
        self.workspaces.read().await.get(workspace_id).map(|runtime| runtime.phase)
    }

    /// (owner_connections, guest_connections), or `None` when absent.
    pub async fn connection_counts(&self, workspace_id: &str) -> Option<(usize, usize)> {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .map(|runtime| (runtime.owner_connections, runtime.guest_connections))
    }

    /// Whether a drain armed with this epoch is still pending. Lets the
    /// reaper skip the teardown lock entirely for cancelled timers.
    pub async fn is_draining(&self, workspace_id: &str, drain_epoch: u64) -> bool {
        self.workspaces
            .read()
            .await
            .get(workspace_id)
            .map(|runtime| {
                runtime.phase == WorkspacePhase::Draining && runtime.drain_epoch == drain_epoch
            })
            .unwrap_or(false)
    }

    pub async fn contains(&self, workspace_id: &str) -> bool {
        self.workspaces.read().await.contains_key(workspace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkspacePhase, WorkspaceRegistry};
    use sandpit_common::types::PlaygroundFiles;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn sender() -> mpsc::UnboundedSender<sandpit_common::protocol::ws::WsMessage> {
        mpsc::unbounded_channel().0
    }

    fn playground(file_id: &str, content: &str) -> PlaygroundFiles {
        let mut files = PlaygroundFiles::default();
        files.files.push(file_id.to_owned());
        files.files_data.insert(file_id.to_owned(), content.to_owned());
        files
    }

    #[tokio::test]
    async fn owner_admission_creates_runtime_and_marks_presence() {
        let registry = WorkspaceRegistry::new();

        let admission = registry.admit_owner("ws-1", Uuid::new_v4(), sender()).await;

        assert!(admission.first_for_workspace);
        assert!(!admission.drain_cancelled);
        assert!(registry.owner_connected("ws-1").await);
        assert_eq!(registry.connection_counts("ws-1").await, Some((1, 0)));
        assert_eq!(registry.phase("ws-1").await, Some(WorkspacePhase::Loading));
    }

    #[tokio::test]
    async fn guest_before_owner_is_rejected_without_creating_state() {
        let registry = WorkspaceRegistry::new();

        assert!(!registry.admit_guest("ws-1", Uuid::new_v4(), sender()).await);
        assert!(!registry.contains("ws-1").await);
    }

    #[tokio::test]
    async fn guest_after_owner_departure_is_rejected() {
        let registry = WorkspaceRegistry::new();
        let owner_session = Uuid::new_v4();

        registry.admit_owner("ws-1", owner_session, sender()).await;
        registry.disconnect("ws-1", owner_session, true).await;

        assert!(!registry.admit_guest("ws-1", Uuid::new_v4(), sender()).await);
    }

    #[tokio::test]
    async fn owner_connected_tracks_the_owner_count() {
        let registry = WorkspaceRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        registry.admit_owner("ws-1", first, sender()).await;
        registry.admit_owner("ws-1", second, sender()).await;
        assert_eq!(registry.connection_counts("ws-1").await, Some((2, 0)));

        assert!(registry.disconnect("ws-1", first, true).await.is_none());
        assert!(registry.owner_connected("ws-1").await);

        let departure = registry.disconnect("ws-1", second, true).await;
        assert!(departure.is_some());
        assert!(!registry.owner_connected("ws-1").await);
        assert_eq!(registry.phase("ws-1").await, Some(WorkspacePhase::Draining));
    }

    #[tokio::test]
    async fn counts_never_go_negative_under_concurrent_churn() {
        let registry = Arc::new(WorkspaceRegistry::new());
        registry.admit_owner("ws-1", Uuid::new_v4(), sender()).await;

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let session = Uuid::new_v4();
                if registry.admit_guest("ws-1", session, sender()).await {
                    registry.disconnect("ws-1", session, false).await;
                }
                // Stray disconnects for sessions that were never admitted
                // must not underflow the counters.
                registry.disconnect("ws-1", Uuid::new_v4(), false).await;
            }));
        }
        for handle in handles {
            handle.await.expect("registry churn task should finish");
        }

        let (owners, guests) = registry
            .connection_counts("ws-1")
            .await
            .expect("workspace should still be present");
        assert_eq!(owners, 1);
        assert_eq!(guests, 0);
    }

    #[tokio::test]
    async fn reconnect_during_drain_cancels_the_pending_epoch() {
        let registry = WorkspaceRegistry::new();
        let owner_session = Uuid::new_v4();

        registry.admit_owner("ws-1", owner_session, sender()).await;
        let departure = registry
            .disconnect("ws-1", owner_session, true)
            .await
            .expect("last owner disconnect should start a drain");

        let admission = registry.admit_owner("ws-1", Uuid::new_v4(), sender()).await;
        assert!(admission.drain_cancelled);
        assert_eq!(registry.phase("ws-1").await, Some(WorkspacePhase::Active));

        // The old epoch no longer authorizes a teardown.
        assert!(!registry.is_draining("ws-1", departure.drain_epoch).await);
        assert!(registry.begin_teardown("ws-1", departure.drain_epoch).await.is_none());
        assert!(registry.contains("ws-1").await);
    }

    #[tokio::test]
    async fn begin_teardown_evicts_a_still_draining_workspace() {
        let registry = WorkspaceRegistry::new();
        let owner_session = Uuid::new_v4();

        registry.admit_owner("ws-1", owner_session, sender()).await;
        registry.install_files("ws-1", playground("index.js", "1")).await;
        let departure = registry
            .disconnect("ws-1", owner_session, true)
            .await
            .expect("drain should start");

        let evicted = registry
            .begin_teardown("ws-1", departure.drain_epoch)
            .await
            .expect("drain is still pending, teardown should win");
        assert_eq!(evicted.cached_files, 1);
        assert!(!registry.contains("ws-1").await);

        // A second attempt with the same epoch finds nothing.
        assert!(registry.begin_teardown("ws-1", departure.drain_epoch).await.is_none());
    }

    #[tokio::test]
    async fn install_files_is_first_writer_wins() {
        let registry = WorkspaceRegistry::new();
        registry.admit_owner("ws-1", Uuid::new_v4(), sender()).await;

        let installed = registry
            .install_files("ws-1", playground("index.js", "first"))
            .await
            .expect("workspace is present");
        assert_eq!(installed.files_data["index.js"], "first");
        assert_eq!(registry.phase("ws-1").await, Some(WorkspacePhase::Active));

        // A racing second load must not clobber the installed cache.
        let effective = registry
            .install_files("ws-1", playground("index.js", "second"))
            .await
            .expect("workspace is present");
        assert_eq!(effective.files_data["index.js"], "first");
    }

    #[tokio::test]
    async fn upsert_file_is_visible_to_all_readers() {
        let registry = WorkspaceRegistry::new();
        registry.admit_owner("ws-1", Uuid::new_v4(), sender()).await;
        registry.install_files("ws-1", playground("index.js", "old")).await;

        assert!(registry.upsert_file("ws-1", "index.js", "new".to_owned()).await);
        assert!(registry.upsert_file("ws-1", "notes.md", "fresh".to_owned()).await);

        let files = registry.files("ws-1").await.expect("cache should be installed");
        assert_eq!(files.files_data["index.js"], "new");
        assert_eq!(files.files_data["notes.md"], "fresh");
        assert!(files.files.contains(&"notes.md".to_owned()));
    }

    #[tokio::test]
    async fn upsert_file_fails_when_workspace_is_not_loaded() {
        let registry = WorkspaceRegistry::new();
        assert!(!registry.upsert_file("ws-1", "index.js", "data".to_owned()).await);

        registry.admit_owner("ws-1", Uuid::new_v4(), sender()).await;
        // Present but still Loading: no cache yet.
        assert!(!registry.upsert_file("ws-1", "index.js", "data".to_owned()).await);
    }
}
