// Admission policy: owners are always admitted, guests only while the owner
// is connected.

use std::sync::Arc;

use sandpit_common::protocol::ws::WsMessage;
use tokio::sync::mpsc;

use crate::error::ErrorCode;
use crate::handshake::Session;
use crate::registry::{OwnerAdmission, WorkspaceRegistry};

/// A granted admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Owner(OwnerAdmission),
    Guest,
}

/// The connection was not admitted; it may stay open just long enough to
/// deliver the `disable_access` notice carrying this reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct AccessDenied {
    pub reason: String,
}

impl AccessDenied {
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::UnauthorizedGuestAccess
    }
}

/// Gates admission using the handshake result and current workspace
/// presence.
pub struct AccessController {
    registry: Arc<WorkspaceRegistry>,
}

impl AccessController {
    pub fn new(registry: Arc<WorkspaceRegistry>) -> Self {
        Self { registry }
    }

    /// Admits or refuses a freshly authenticated session. The guest check is
    /// a point-in-time read: a guest arriving before the owner is refused
    /// even if the owner connects moments later.
    pub async fn admit(
        &self,
        session: &Session,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) -> Result<Admission, AccessDenied> {
        if session.is_owner {
            let admission = self
                .registry
                .admit_owner(&session.workspace_id, session.session_id, outbound)
                .await;
            return Ok(Admission::Owner(admission));
        }

        if self
            .registry
            .admit_guest(&session.workspace_id, session.session_id, outbound)
            .await
        {
            Ok(Admission::Guest)
        } else {
            Err(AccessDenied { reason: "The playground owner is not connected.".to_owned() })
        }
    }
}
