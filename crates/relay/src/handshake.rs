// Connection handshake: parameter validation and identity resolution.
//
// The handshake travels in the connection-open query string and completes
// before the WebSocket upgrade is accepted, so no events are processed for a
// connection whose identity is still unresolved.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::clients::records::RecordStore;
use crate::error::ErrorCode;

/// The four required connection-open parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub user_id: String,
    pub workspace_id: String,
    pub protocol_version: String,
    pub transport_kind: String,
}

impl ConnectParams {
    /// Validates presence and shape of every required parameter. The
    /// connection is refused before any state is created when one is
    /// missing or empty.
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, HandshakeError> {
        let field = |name: &'static str| -> Result<String, HandshakeError> {
            query
                .get(name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
                .ok_or(HandshakeError::InvalidRequest { field: name })
        };

        Ok(Self {
            user_id: field("user_id")?,
            workspace_id: field("workspace_id")?,
            protocol_version: field("protocol_version")?,
            transport_kind: field("transport_kind")?,
        })
    }
}

/// A connection's resolved identity and role within a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub workspace_id: String,
    pub is_owner: bool,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: String, workspace_id: String, is_owner: bool) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            workspace_id,
            is_owner,
            connected_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("missing or empty handshake parameter `{field}`")]
    InvalidRequest { field: &'static str },

    #[error("identity lookup failed: {reason}")]
    IdentityLookupFailed { reason: String },
}

impl HandshakeError {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::IdentityLookupFailed { .. } => ErrorCode::IdentityLookupFailed,
        }
    }
}

/// Resolves the connecting user against the record service and computes
/// ownership of the requested workspace.
pub struct HandshakeAuthenticator {
    records: RecordStore,
}

impl HandshakeAuthenticator {
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }

    /// Looks the user up (hard suspension point: the connection carries no
    /// session until this returns) and builds the session descriptor.
    pub async fn authenticate(&self, params: &ConnectParams) -> Result<Session, HandshakeError> {
        let user = self
            .records
            .lookup_user(&params.user_id)
            .await
            .map_err(|error| {
                warn!(user_id = %params.user_id, error = %error, "record service lookup failed");
                HandshakeError::IdentityLookupFailed { reason: error.to_string() }
            })?
            .ok_or_else(|| HandshakeError::IdentityLookupFailed {
                reason: format!("no record for user `{}`", params.user_id),
            })?;

        let is_owner = user.owned_workspace_ids.iter().any(|id| id == &params.workspace_id);

        Ok(Session::new(user.id, params.workspace_id.clone(), is_owner))
    }
}
