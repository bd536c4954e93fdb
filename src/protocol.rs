//! Wire message envelope shared by server and client (spec §6). Tagged
//! enums over `type`, camelCase field names to match the wire shapes
//! exactly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::Operation;
use crate::vector_clock::VectorClock;

/// Fields shared by OPERATION in both directions; the server rewrites
/// `user_id` and `timestamp` before rebroadcasting the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMessage {
    pub document_id: String,
    pub user_id: String,
    pub timestamp: u64,
    pub operation: Operation,
    pub vector_clock: VectorClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPositionMessage {
    pub document_id: String,
    pub user_id: String,
    pub timestamp: u64,
    pub position: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionMessage {
    pub document_id: String,
    pub user_id: String,
    pub timestamp: u64,
    pub selection: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Active,
    Idle,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub user_id: String,
    pub timestamp: u64,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDocumentMessage {
    pub document_id: String,
    pub user_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveDocumentMessage {
    pub document_id: String,
    pub user_id: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestMessage {
    pub document_id: String,
    pub user_id: String,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_vector_clock: Option<VectorClock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseMessage {
    pub document_id: String,
    pub operations: Vec<Operation>,
    pub current_vector_clock: VectorClock,
    pub timestamp: u64,
}

/// Entry in `USER_LIST`. Every field besides `user_id` is best-effort
/// presence metadata; the server does not require any of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Value>,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Auth { token: String },
    JoinDocument(JoinDocumentMessage),
    LeaveDocument(LeaveDocumentMessage),
    Operation(OperationMessage),
    CursorPosition(CursorPositionMessage),
    Selection(SelectionMessage),
    Presence(PresenceMessage),
    SyncRequest(SyncRequestMessage),
    Ping,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    AuthSuccess {
        #[serde(rename = "userId")]
        user_id: String,
    },
    AuthError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Operation(OperationMessage),
    CursorPosition(CursorPositionMessage),
    Selection(SelectionMessage),
    Presence(PresenceMessage),
    UserList {
        users: Vec<UserSummary>,
    },
    SyncResponse(SyncResponseMessage),
    Error {
        error: String,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;

    #[test]
    fn client_message_tag_round_trips() {
        let msg = ClientMessage::Auth {
            token: "abc".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"AUTH\""));
        assert!(json.contains("\"token\":\"abc\""));
    }

    #[test]
    fn operation_message_uses_camel_case_fields() {
        let msg = ClientMessage::Operation(OperationMessage {
            document_id: "doc1".to_string(),
            user_id: "user1".to_string(),
            timestamp: 1,
            operation: Operation::new(
                OperationType::Insert {
                    position: 0,
                    content: "hi".to_string(),
                },
                "user1",
                1,
            ),
            vector_clock: VectorClock::new(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"documentId\":\"doc1\""));
        assert!(json.contains("\"vectorClock\""));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"NOT_A_REAL_TYPE"}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn sync_response_round_trips() {
        let msg = ServerMessage::SyncResponse(SyncResponseMessage {
            document_id: "doc1".to_string(),
            operations: vec![],
            current_vector_clock: VectorClock::new(),
            timestamp: 42,
        });
        let json = serde_json::to_string(&msg).unwrap();
        let restored: ServerMessage = serde_json::from_str(&json).unwrap();
        match restored {
            ServerMessage::SyncResponse(m) => assert_eq!(m.timestamp, 42),
            _ => panic!("wrong variant"),
        }
    }
}
