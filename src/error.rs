//! Crate-wide error types.
//!
//! Library modules return `Result<T, CollabError>`. `anyhow` is reserved
//! for the binary/application boundary (server accept loop, client
//! session tasks), matching the split the teacher's `main.rs` draws
//! between typed command results and ad-hoc error formatting.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("duplicate operation id: {0}")]
    DuplicateOperation(String),

    #[error("unknown operation variant")]
    UnknownOperationType,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("document room not found: {0}")]
    RoomNotFound(String),

    #[error("connection is not authenticated")]
    NotAuthenticated,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, CollabError>;
