//! The `Operation` tagged union (spec §3): INSERT, DELETE, RETAIN, FORMAT.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Variant-specific payload. Kept as a sum type so the transformer's
/// matches stay exhaustive (spec §9 Design Note).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum OperationType {
    Insert { position: usize, content: String },
    Delete { position: usize, length: usize },
    Retain { position: usize, length: usize },
    Format {
        position: usize,
        length: usize,
        attributes: HashMap<String, Value>,
    },
}

impl OperationType {
    pub fn position(&self) -> usize {
        match self {
            OperationType::Insert { position, .. }
            | OperationType::Delete { position, .. }
            | OperationType::Retain { position, .. }
            | OperationType::Format { position, .. } => *position,
        }
    }

    pub fn set_position(&mut self, new_position: usize) {
        match self {
            OperationType::Insert { position, .. }
            | OperationType::Delete { position, .. }
            | OperationType::Retain { position, .. }
            | OperationType::Format { position, .. } => *position = new_position,
        }
    }

    pub fn length(&self) -> usize {
        match self {
            OperationType::Insert { content, .. } => content.chars().count(),
            OperationType::Delete { length, .. }
            | OperationType::Retain { length, .. }
            | OperationType::Format { length, .. } => *length,
        }
    }

    pub fn is_zero_length(&self) -> bool {
        match self {
            OperationType::Insert { content, .. } => content.is_empty(),
            OperationType::Delete { length, .. } => *length == 0,
            OperationType::Retain { .. } | OperationType::Format { .. } => false,
        }
    }
}

/// An immutable, globally-identified edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(flatten)]
    pub operation_type: OperationType,
    pub user_id: String,
    /// Lamport-style monotonic timestamp, not wall-clock-critical.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<HashSet<String>>,
}

impl Operation {
    pub fn new(operation_type: OperationType, user_id: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation_type,
            user_id: user_id.into(),
            timestamp,
            dependencies: None,
        }
    }

    pub fn position(&self) -> usize {
        self.operation_type.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_length_is_content_len() {
        let op = Operation::new(
            OperationType::Insert {
                position: 0,
                content: "hello".to_string(),
            },
            "u1",
            1,
        );
        assert_eq!(op.operation_type.length(), 5);
    }

    #[test]
    fn user_id_serializes_as_camel_case() {
        let op = Operation::new(
            OperationType::Retain {
                position: 0,
                length: 1,
            },
            "u1",
            1,
        );
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"userId\":\"u1\""));
        assert!(!json.contains("\"user_id\""));
    }

    #[test]
    fn wire_tag_round_trips() {
        let op = Operation::new(
            OperationType::Delete {
                position: 2,
                length: 3,
            },
            "u1",
            1,
        );
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"type\":\"DELETE\""));
        let restored: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.operation_type, op.operation_type);
    }
}
