//! JSON wire protocol.
//!
//! Frames travel as WebSocket text messages. Document selectors are the
//! string `"registry"`, the string `"bulletins"`, or `{"listId": id}`;
//! CRDT sync payloads ride inside `sync.data` as base64.
//!
//! ```text
//! client → server: hello | subscribe | unsubscribe | registry_action
//!                  | list_action | bulletin_action | sync | request_full_state
//! server → client: welcome | snapshot | sync | error
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_core::{BulletinAction, DocKey, ListAction, RegistryAction};

/// Stable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Forbidden,
    NotFound,
    RateLimited,
}

/// Frames a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Hello {
        client_version: String,
    },
    Subscribe {
        doc: DocKey,
    },
    Unsubscribe {
        doc: DocKey,
    },
    RegistryAction {
        action: RegistryAction,
    },
    ListAction {
        list_id: Uuid,
        action: ListAction,
    },
    BulletinAction {
        action: BulletinAction,
    },
    Sync {
        doc: DocKey,
        data: String,
    },
    RequestFullState {
        #[serde(default)]
        doc: Option<DocKey>,
    },
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Welcome {
        user_id: String,
    },
    Snapshot {
        doc: DocKey,
        state: serde_json::Value,
    },
    Sync {
        doc: DocKey,
        data: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }
}

/// Encode opaque sync bytes for the wire.
pub fn encode_sync_data(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a `sync.data` field. Failure maps to `BAD_REQUEST`.
pub fn decode_sync_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}
