//! `collab_core`: CRDT + operational transformation engine for
//! real-time multi-user text editing, plus the WebSocket relay that
//! routes operations between replicas.

pub mod client;
pub mod config;
pub mod connection;
pub mod crdt;
pub mod error;
pub mod metrics;
pub mod operation;
pub mod protocol;
pub mod server;
pub mod transform;
pub mod vector_clock;

pub use client::{ClientSession, SessionState, TokenProvider};
pub use config::{ClientConfig, ServerConfig};
pub use connection::{ConnectionManager, UserConnection};
pub use crdt::{ChangeEvent, Conflict, ConflictResolution, CrdtConfig, CursorEvent, MultiUserCRDT};
pub use error::{CollabError, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use operation::{Operation, OperationType};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{AuthValidator, WebSocketServer};
pub use transform::OperationTransformer;
pub use vector_clock::{ClockOrdering, VectorClock};
