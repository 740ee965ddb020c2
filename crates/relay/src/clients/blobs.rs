// Client for the external blob store holding playground file bytes.
//
// The store keys files under a per-workspace prefix. Reads happen once per
// workspace load; writes are best-effort and issued per save. Deleting a
// whole prefix belongs to the external teardown path and is not called from
// this service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sandpit_common::types::PlaygroundFiles;
use serde::Serialize;
use tokio::sync::RwLock;

use super::SERVICE_TIMEOUT_SECS;

#[derive(Debug, Serialize)]
struct SaveFileBody<'a> {
    workspace_id: &'a str,
    file_id: &'a str,
    content: &'a str,
}

#[derive(Debug, Default)]
pub struct MemoryBlobs {
    playgrounds: HashMap<String, PlaygroundFiles>,
    fail_writes: bool,
}

/// Blob store access. `Http` is the production path; `Memory` backs tests
/// with an in-process file map and a switchable write-failure mode.
#[derive(Clone)]
pub enum BlobStore {
    Http {
        client: reqwest::Client,
        base_url: Arc<str>,
        service_key: Arc<str>,
    },
    #[cfg_attr(not(test), allow(dead_code))]
    Memory(Arc<RwLock<MemoryBlobs>>),
}

impl BlobStore {
    pub fn http(base_url: &str, service_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SERVICE_TIMEOUT_SECS))
            .build()
            .context("failed to build blob store client")?;

        Ok(Self::Http {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            service_key: Arc::from(service_key),
        })
    }

    /// Loads the playground's file tree and contents. A workspace with no
    /// stored files yields an empty playground.
    pub async fn load_playground(&self, workspace_id: &str) -> anyhow::Result<PlaygroundFiles> {
        match self {
            Self::Http { client, base_url, service_key } => {
                let response = client
                    .get(format!("{base_url}/api/project"))
                    .query(&[("id", workspace_id)])
                    .header("Authorization", service_key.as_ref())
                    .send()
                    .await
                    .context("blob store unreachable")?;

                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(PlaygroundFiles::default());
                }
                let response = response
                    .error_for_status()
                    .context("blob store returned an error status")?;
                response
                    .json::<PlaygroundFiles>()
                    .await
                    .context("blob store returned an unparsable payload")
            }
            Self::Memory(store) => Ok(store
                .read()
                .await
                .playgrounds
                .get(workspace_id)
                .cloned()
                .unwrap_or_default()),
        }
    }

    /// Writes one file's content under the workspace prefix.
    pub async fn write_file(
        &self,
        workspace_id: &str,
        file_id: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        match self {
            Self::Http { client, base_url, service_key } => {
                client
                    .post(format!("{base_url}/api/save"))
                    .header("Authorization", service_key.as_ref())
                    .json(&SaveFileBody { workspace_id, file_id, content })
                    .send()
                    .await
                    .context("blob store unreachable")?
                    .error_for_status()
                    .context("blob store refused the file write")?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut store = store.write().await;
                if store.fail_writes {
                    anyhow::bail!("blob store write failure injected for tests");
                }
                let playground = store.playgrounds.entry(workspace_id.to_owned()).or_default();
                if !playground.files_data.contains_key(file_id) {
                    playground.files.push(file_id.to_owned());
                }
                playground.files_data.insert(file_id.to_owned(), content.to_owned());
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryBlobs::default())))
    }

    #[cfg(test)]
    pub(crate) async fn seed_for_tests(&self, workspace_id: &str, playground: PlaygroundFiles) {
        if let Self::Memory(store) = self {
            store.write().await.playgrounds.insert(workspace_id.to_owned(), playground);
        }
    }

    #[cfg(test)]
    pub(crate) async fn fail_writes_for_tests(&self, fail: bool) {
        if let Self::Memory(store) = self {
            store.write().await.fail_writes = fail;
        }
    }

    #[cfg(test)]
    pub(crate) async fn stored_file_for_tests(
        &self,
        workspace_id: &str,
        file_id: &str,
    ) -> Option<String> {
        match self {
            Self::Memory(store) => store
                .read()
                .await
                .playgrounds
                .get(workspace_id)
                .and_then(|playground| playground.files_data.get(file_id).cloned()),
            _ => None,
        }
    }
}
