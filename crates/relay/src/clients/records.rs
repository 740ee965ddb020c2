// Client for the external record service (user and workspace metadata).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::SERVICE_TIMEOUT_SECS;

/// A user as returned by the record service, including the workspaces the
/// user owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub owned_workspace_ids: Vec<String>,
}

/// Record service access. `Http` is the production path; `Memory` backs
/// tests with a plain user map.
#[derive(Clone)]
pub enum RecordStore {
    Http {
        client: reqwest::Client,
        base_url: Arc<str>,
        service_key: Arc<str>,
    },
    #[cfg_attr(not(test), allow(dead_code))]
    Memory(Arc<RwLock<HashMap<String, UserRecord>>>),
}

impl RecordStore {
    pub fn http(base_url: &str, service_key: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SERVICE_TIMEOUT_SECS))
            .build()
            .context("failed to build record service client")?;

        Ok(Self::Http {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            service_key: Arc::from(service_key),
        })
    }

    /// Fetches a user by id. `Ok(None)` means the service answered but holds
    /// no record; an `Err` means the service was unreachable or returned an
    /// unparsable payload.
    pub async fn lookup_user(&self, user_id: &str) -> anyhow::Result<Option<UserRecord>> {
        match self {
            Self::Http { client, base_url, service_key } => {
                let response = client
                    .get(format!("{base_url}/api/user"))
                    .query(&[("id", user_id)])
                    .header("Authorization", service_key.as_ref())
                    .send()
                    .await
                    .context("record service unreachable")?;

                if response.status() == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                let response = response
                    .error_for_status()
                    .context("record service returned an error status")?;
                let record = response
                    .json::<UserRecord>()
                    .await
                    .context("record service returned an unparsable payload")?;
                Ok(Some(record))
            }
            Self::Memory(store) => Ok(store.read().await.get(user_id).cloned()),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_tests(&self, record: UserRecord) {
        if let Self::Memory(store) = self {
            store.write().await.insert(record.id.clone(), record);
        }
    }
}
