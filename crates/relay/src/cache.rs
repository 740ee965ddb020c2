// In-memory authoritative file cache, synchronized with the blob store.
//
// The first admission to a workspace loads the playground from the blob
// store; every later admission reuses the installed cache. Saves mutate the
// cache synchronously (visible to all sessions of the workspace) and persist
// asynchronously, best effort.

use std::sync::Arc;

use anyhow::Context;
use sandpit_common::{protocol::ws::WsMessage, types::PlaygroundFiles};
use tokio::sync::mpsc;
use tracing::warn;

use crate::clients::blobs::BlobStore;
use crate::error::ErrorCode;
use crate::handshake::Session;
use crate::ratelimit::RateLimiter;
use crate::registry::WorkspaceRegistry;

/// A save was dropped before or after the gate it names; in every case the
/// cache is left exactly as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SaveError {
    #[error("file exceeds the maximum allowed size of {max_bytes} bytes")]
    PayloadTooLarge { max_bytes: usize },

    #[error("rate limited: file saving")]
    RateLimitExceeded,

    #[error("workspace is no longer loaded")]
    WorkspaceNotLoaded,
}

impl SaveError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::RateLimitExceeded => ErrorCode::RateLimitExceeded,
            Self::WorkspaceNotLoaded => ErrorCode::InternalError,
        }
    }
}

/// Loads, serves, and mutates per-workspace file state.
pub struct FileSyncService {
    registry: Arc<WorkspaceRegistry>,
    blobs: BlobStore,
    save_limiter: RateLimiter,
    max_save_bytes: usize,
}

impl FileSyncService {
    pub fn new(
        registry: Arc<WorkspaceRegistry>,
        blobs: BlobStore,
        save_limiter: RateLimiter,
        max_save_bytes: usize,
    ) -> Self {
        Self { registry, blobs, save_limiter, max_save_bytes }
    }

    /// Returns the workspace's file cache, fetching it from the blob store
    /// on first admission. The fetch runs without holding the registry lock;
    /// installation is first-writer-wins, so a concurrent load cannot
    /// clobber an already-live cache.
    pub async fn ensure_loaded(&self, workspace_id: &str) -> anyhow::Result<PlaygroundFiles> {
        if let Some(files) = self.registry.files(workspace_id).await {
            return Ok(files);
        }

        let loaded = self
            .blobs
            .load_playground(workspace_id)
            .await
            .with_context(|| format!("failed to load playground `{workspace_id}`"))?;

        self.registry
            .install_files(workspace_id, loaded)
            .await
            .with_context(|| format!("workspace `{workspace_id}` was evicted during load"))
    }

    /// Applies one `save_file` operation: size gate, rate gate, synchronous
    /// cache update, asynchronous persistence. A failed persistence write is
    /// logged and reported to the invoking session as a non-fatal notice;
    /// the cache is not rolled back.
    pub async fn apply_save(
        &self,
        session: &Session,
        file_id: &str,
        content: String,
        outbound: &mpsc::UnboundedSender<WsMessage>,
    ) -> Result<(), SaveError> {
        if content.len() > self.max_save_bytes {
            return Err(SaveError::PayloadTooLarge { max_bytes: self.max_save_bytes });
        }

        self.save_limiter
            .consume(&session.user_id, 1.0)
            .await
            .map_err(|_| SaveError::RateLimitExceeded)?;

        if !self
            .registry
            .upsert_file(&session.workspace_id, file_id, content.clone())
            .await
        {
            return Err(SaveError::WorkspaceNotLoaded);
        }

        let blobs = self.blobs.clone();
        let workspace_id = session.workspace_id.clone();
        let file_id = file_id.to_owned();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            if let Err(error) = blobs.write_file(&workspace_id, &file_id, &content).await {
                warn!(
                    workspace_id = %workspace_id,
                    file_id = %file_id,
                    error = %error,
                    "failed to persist file save",
                );
                let _ = outbound.send(WsMessage::Error {
                    code: ErrorCode::PersistenceFailure.as_str().to_owned(),
                    message: "your change is live in the session but could not be persisted"
                        .to_owned(),
                    retryable: ErrorCode::PersistenceFailure.retryable(),
                });
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FileSyncService, SaveError};
    use crate::clients::blobs::BlobStore;
    use crate::handshake::Session;
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use crate::registry::WorkspaceRegistry;
    use sandpit_common::{protocol::ws::WsMessage, types::PlaygroundFiles};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const MAX_SAVE_BYTES: usize = 64;

    fn playground(entries: &[(&str, &str)]) -> PlaygroundFiles {
        let mut files = PlaygroundFiles::default();
        for (file_id, content) in entries {
            files.files.push(file_id.to_string());
            files.files_data.insert(file_id.to_string(), content.to_string());
        }
        files.problem_statement = "Fix the bug.".to_string();
        files
    }

    fn service(
        registry: Arc<WorkspaceRegistry>,
        blobs: BlobStore,
        capacity: f64,
    ) -> FileSyncService {
        FileSyncService::new(
            registry,
            blobs,
            RateLimiter::new(RateLimitConfig { capacity, refill_per_sec: 1.0 }),
            MAX_SAVE_BYTES,
        )
    }

    fn owner_session(workspace_id: &str) -> Session {
        Session::new("user-1".to_string(), workspace_id.to_string(), true)
    }

    async fn admitted_workspace(registry: &WorkspaceRegistry, session: &Session) {
        registry
            .admit_owner(&session.workspace_id, session.session_id, mpsc::unbounded_channel().0)
            .await;
    }

    async fn wait_for_persisted(blobs: &BlobStore, workspace_id: &str, file_id: &str) -> String {
        for _ in 0..64 {
            tokio::task::yield_now().await;
            if let Some(content) = blobs.stored_file_for_tests(workspace_id, file_id).await {
                return content;
            }
        }
        panic!("file `{file_id}` was never persisted");
    }

    #[tokio::test]
    async fn first_admission_loads_and_later_admissions_reuse_the_cache() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let blobs = BlobStore::for_tests();
        blobs
            .seed_for_tests("ws-1", playground(&[("a.js", "1"), ("b.js", "2"), ("c.js", "3")]))
            .await;
        let service = service(Arc::clone(&registry), blobs.clone(), 5.0);
        let session = owner_session("ws-1");
        admitted_workspace(&registry, &session).await;

        let loaded = service.ensure_loaded("ws-1").await.expect("load should succeed");
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.problem_statement, "Fix the bug.");

        // A later admission sees the cached copy, not a fresh fetch.
        blobs.seed_for_tests("ws-1", playground(&[("other.js", "x")])).await;
        let reused = service.ensure_loaded("ws-1").await.expect("reuse should succeed");
        assert_eq!(reused.len(), 3);
    }

    #[tokio::test]
    async fn save_updates_the_cache_and_persists_to_the_blob_store() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let blobs = BlobStore::for_tests();
        blobs.seed_for_tests("ws-1", playground(&[("a.js", "old")])).await;
        let service = service(Arc::clone(&registry), blobs.clone(), 5.0);
        let session = owner_session("ws-1");
        admitted_workspace(&registry, &session).await;
        service.ensure_loaded("ws-1").await.expect("load should succeed");

        let (outbound, _rx) = mpsc::unbounded_channel();
        service
            .apply_save(&session, "a.js", "new".to_string(), &outbound)
            .await
            .expect("save should succeed");

        let cached = registry.files("ws-1").await.expect("cache should be installed");
        assert_eq!(cached.files_data["a.js"], "new");
        assert_eq!(wait_for_persisted(&blobs, "ws-1", "a.js").await, "new");
    }

    #[tokio::test]
    async fn oversized_save_never_mutates_the_cache() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let blobs = BlobStore::for_tests();
        blobs.seed_for_tests("ws-1", playground(&[("a.js", "old")])).await;
        let service = service(Arc::clone(&registry), blobs, 5.0);
        let session = owner_session("ws-1");
        admitted_workspace(&registry, &session).await;
        service.ensure_loaded("ws-1").await.expect("load should succeed");

        let (outbound, _rx) = mpsc::unbounded_channel();
        let oversized = "x".repeat(MAX_SAVE_BYTES + 1);
        let error = service
            .apply_save(&session, "a.js", oversized, &outbound)
            .await
            .expect_err("oversized payload must be dropped");

        assert_eq!(error, SaveError::PayloadTooLarge { max_bytes: MAX_SAVE_BYTES });
        let cached = registry.files("ws-1").await.expect("cache should be installed");
        assert_eq!(cached.files_data["a.js"], "old");
    }

    #[tokio::test]
    async fn five_saves_succeed_and_the_sixth_is_rate_limited() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let blobs = BlobStore::for_tests();
        blobs
            .seed_for_tests("ws-1", playground(&[("a.js", "1"), ("b.js", "2"), ("c.js", "3")]))
            .await;
        let service = service(Arc::clone(&registry), blobs, 5.0);
        let session = owner_session("ws-1");
        admitted_workspace(&registry, &session).await;
        service.ensure_loaded("ws-1").await.expect("load should succeed");

        let (outbound, _rx) = mpsc::unbounded_channel();
        for n in 0..5 {
            service
                .apply_save(&session, "a.js", format!("content-{n}"), &outbound)
                .await
                .expect("saves within capacity should succeed");
        }

        let error = service
            .apply_save(&session, "a.js", "content-6".to_string(), &outbound)
            .await
            .expect_err("the sixth immediate save must be rate limited");
        assert_eq!(error, SaveError::RateLimitExceeded);

        // The rejected save left the last accepted content in place.
        let cached = registry.files("ws-1").await.expect("cache should be installed");
        assert_eq!(cached.files_data["a.js"], "content-4");
    }

    #[tokio::test]
    async fn oversized_save_does_not_spend_a_rate_token() {
        // Order matters: the size gate runs before the rate gate, so an
        // oversized payload is dropped without debiting a token.
        let registry = Arc::new(WorkspaceRegistry::new());
        let blobs = BlobStore::for_tests();
        blobs.seed_for_tests("ws-1", playground(&[("a.js", "old")])).await;
        let service = service(Arc::clone(&registry), blobs, 1.0);
        let session = owner_session("ws-1");
        admitted_workspace(&registry, &session).await;
        service.ensure_loaded("ws-1").await.expect("load should succeed");

        let (outbound, _rx) = mpsc::unbounded_channel();
        let oversized = "x".repeat(MAX_SAVE_BYTES + 1);
        service
            .apply_save(&session, "a.js", oversized, &outbound)
            .await
            .expect_err("oversized payload must be dropped");

        // The single token is still available.
        service
            .apply_save(&session, "a.js", "fits".to_string(), &outbound)
            .await
            .expect("the token was not spent on the oversized attempt");
    }

    #[tokio::test]
    async fn failed_persistence_keeps_the_cache_and_notifies_the_saver() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let blobs = BlobStore::for_tests();
        blobs.seed_for_tests("ws-1", playground(&[("a.js", "old")])).await;
        let service = service(Arc::clone(&registry), blobs.clone(), 5.0);
        let session = owner_session("ws-1");
        admitted_workspace(&registry, &session).await;
        service.ensure_loaded("ws-1").await.expect("load should succeed");
        blobs.fail_writes_for_tests(true).await;

        let (outbound, mut rx) = mpsc::unbounded_channel();
        service
            .apply_save(&session, "a.js", "new".to_string(), &outbound)
            .await
            .expect("the save itself succeeds; only persistence fails");

        let notice = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("a persistence notice should arrive")
            .expect("the outbound channel should stay open");
        match notice {
            WsMessage::Error { code, retryable, .. } => {
                assert_eq!(code, "PERSISTENCE_FAILURE");
                assert!(retryable);
            }
            other => panic!("expected an error frame, got {other:?}"),
        }

        // No rollback: the in-memory mutation is retained.
        let cached = registry.files("ws-1").await.expect("cache should be installed");
        assert_eq!(cached.files_data["a.js"], "new");
    }

    #[tokio::test]
    async fn save_against_an_evicted_workspace_is_dropped() {
        let registry = Arc::new(WorkspaceRegistry::new());
        let service = service(Arc::clone(&registry), BlobStore::for_tests(), 5.0);
        let session = Session::new("user-1".to_string(), "ws-gone".to_string(), true);

        let (outbound, _rx) = mpsc::unbounded_channel();
        let error = service
            .apply_save(&session, "a.js", "data".to_string(), &outbound)
            .await
            .expect_err("no runtime state exists for this workspace");
        assert_eq!(error, SaveError::WorkspaceNotLoaded);
    }
}
