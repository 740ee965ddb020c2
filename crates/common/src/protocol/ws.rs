// WebSocket message types for the sandpit-play.v1 protocol.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// All message types in the sandpit-play.v1 WebSocket protocol.
///
/// The handshake itself travels in the connection-open query string, so the
/// first frame a client sees is `playground_loaded` (admitted) or
/// `disable_access` (refused).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: replace a file's content.
    SaveFile { file_id: String, content: String },

    /// Server -> Client: the workspace file set delivered on admission.
    PlaygroundLoaded {
        files: Vec<String>,
        files_data: HashMap<String, String>,
        problem_statement: String,
    },

    /// Server -> Client: the connection holds no operation rights.
    DisableAccess { reason: String },

    /// Server -> Client: operation-scoped error notice.
    Error { code: String, message: String, retryable: bool },
}
