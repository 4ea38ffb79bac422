//! Wire protocol for the client session transport.
//!
//! Messages are typed objects with a `type` discriminator and a `data`
//! payload, serialized as JSON over the websocket's text frames.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::operation::{OpType, Operation};
use crate::session::Session;

/// One operation as carried on the wire, before a version has been assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub op_type: WireOpType,
    pub position: u64,
    pub content: Option<String>,
    pub length: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WireOpType {
    Insert,
    Delete,
    Retain,
}

impl OperationRequest {
    pub fn into_operation(self, author: Uuid, base_version: u64) -> Operation {
        let op_type = match self.op_type {
            WireOpType::Insert => OpType::Insert {
                content: self.content.unwrap_or_default(),
            },
            WireOpType::Delete => OpType::Delete {
                length: self.length.unwrap_or(0),
            },
            WireOpType::Retain => OpType::Retain,
        };
        Operation {
            id: Uuid::new_v4(),
            op_type,
            position: self.position,
            author,
            version: base_version,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Rendering of a `Session` for presence broadcasts, without internal fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub user_id: Uuid,
    pub color: &'static str,
    pub cursor_position: u64,
    pub selection_start: u64,
    pub selection_end: u64,
}

impl From<&Session> for UserSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            user_id: session.user_id,
            color: session.color,
            cursor_position: session.cursor_position,
            selection_start: session.selection_start,
            selection_end: session.selection_end,
        }
    }
}

/// Inbound message from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    Operation {
        op: OperationRequest,
        base_version: u64,
    },
    Batch {
        base_version: u64,
        ops: Vec<OperationRequest>,
    },
    Cursor {
        position: u64,
        selection_start: u64,
        selection_end: u64,
    },
    SyncRequest {
        known_version: u64,
    },
    Ping,
}

/// Outbound message to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        document_id: Uuid,
        session_id: Uuid,
        current_version: u64,
        snapshot_text: Option<String>,
        active_users: Vec<UserSnapshot>,
    },
    Operation {
        operation: Operation,
    },
    BatchResult {
        batch_id: Uuid,
        accepted: Vec<Operation>,
        rejected: Vec<RejectedOp>,
        final_version: u64,
    },
    Presence {
        user_id: Uuid,
        color: &'static str,
        cursor_position: u64,
        selection_start: u64,
        selection_end: u64,
    },
    UserJoined {
        user_id: Uuid,
        active_users: Vec<UserSnapshot>,
    },
    UserLeft {
        user_id: Uuid,
        active_users: Vec<UserSnapshot>,
    },
    SyncResponse {
        current_version: u64,
        operations_since: Vec<Operation>,
        active_users: Vec<UserSnapshot>,
    },
    Error {
        code: &'static str,
        message: String,
    },
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedOp {
    pub index: usize,
    pub reason: String,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.as_str(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trips_through_json() {
        let msg = ClientMessage::Operation {
            op: OperationRequest {
                op_type: WireOpType::Insert,
                position: 0,
                content: Some("hi".to_string()),
                length: None,
            },
            base_version: 3,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ClientMessage::Operation { base_version, .. } => assert_eq!(base_version, 3),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_error_carries_stable_code() {
        let msg = ServerMessage::error(ErrorCode::StaleBase, "resync required");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("STALE_BASE"));
    }
}
