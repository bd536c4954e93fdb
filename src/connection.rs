//! Server-side connection and document-room registry (spec §4.4).
//!
//! Built on `dashmap` rather than a hand-rolled `Mutex<HashMap<..>>`,
//! mirroring the teacher's `AppState` shape in `main.rs`: each table is
//! independently lockable per-shard, so a broadcast never holds a
//! whole-table lock across a socket write.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::protocol::ServerMessage;

pub type ConnectionId = Uuid;

/// Outbound half of a connection's socket. The server never blocks a
/// broadcast on another recipient; each connection owns a bounded
/// mpsc channel drained by its own write task.
pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;

/// Server-side record for one authenticated socket (spec §3).
#[derive(Clone)]
pub struct UserConnection {
    pub id: ConnectionId,
    pub user_id: String,
    pub document_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    sender: OutboundSender,
}

impl UserConnection {
    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Document room: the set of connection ids currently joined. Rooms
/// with zero members are not reified (spec §3 invariant).
#[derive(Default)]
struct DocumentRoom {
    members: HashSet<ConnectionId>,
}

/// In-memory registry of authenticated connections and their document
/// rooms. The engine's sole mutator of connection/room state (spec
/// §5): callers serialize access to a single connection's room
/// transition with the internal `Mutex`, but broadcasts never hold a
/// table-wide lock across a send.
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, UserConnection>,
    rooms: DashMap<String, DocumentRoom>,
    /// Guards the read-modify-write sequence in `join_document` /
    /// `leave_document` so a connection can't race itself between two
    /// rooms; held only across map mutation, never across a send.
    membership_lock: Mutex<()>,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            membership_lock: Mutex::new(()),
        })
    }

    pub fn add_connection(&self, user_id: impl Into<String>, sender: OutboundSender) -> UserConnection {
        let connection = UserConnection {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            document_id: None,
            connected_at: Utc::now(),
            sender,
        };
        self.connections.insert(connection.id, connection.clone());
        tracing::info!(connection_id = %connection.id, user_id = %connection.user_id, "connection registered");
        connection
    }

    pub async fn remove_connection(&self, connection_id: ConnectionId) {
        let document_id = self
            .connections
            .get(&connection_id)
            .and_then(|c| c.document_id.clone());

        if let Some(document_id) = document_id {
            self.leave_document(connection_id, &document_id).await;
        }

        self.connections.remove(&connection_id);
        tracing::info!(connection_id = %connection_id, "connection removed");
    }

    pub async fn join_document(&self, connection_id: ConnectionId, document_id: impl Into<String>) {
        let document_id = document_id.into();
        let _guard = self.membership_lock.lock().await;

        let previous = self
            .connections
            .get(&connection_id)
            .and_then(|c| c.document_id.clone());
        if let Some(previous) = previous {
            if previous != document_id {
                self.leave_document_locked(connection_id, &previous);
            } else {
                return;
            }
        }

        self.rooms
            .entry(document_id.clone())
            .or_default()
            .members
            .insert(connection_id);

        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.document_id = Some(document_id.clone());
        }

        tracing::info!(connection_id = %connection_id, document_id = %document_id, "joined document");
    }

    pub async fn leave_document(&self, connection_id: ConnectionId, document_id: &str) {
        let _guard = self.membership_lock.lock().await;
        self.leave_document_locked(connection_id, document_id);
    }

    fn leave_document_locked(&self, connection_id: ConnectionId, document_id: &str) {
        let mut now_empty = false;
        if let Some(mut room) = self.rooms.get_mut(document_id) {
            room.members.remove(&connection_id);
            now_empty = room.members.is_empty();
        }
        if now_empty {
            self.rooms.remove(document_id);
        }

        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            if connection.document_id.as_deref() == Some(document_id) {
                connection.document_id = None;
            }
        }

        tracing::info!(connection_id = %connection_id, document_id = %document_id, "left document");
    }

    /// Best-effort: a send failure on one recipient never blocks the
    /// others, and the server does not retry (spec §4.4).
    pub fn broadcast_to_document(
        &self,
        document_id: &str,
        message: ServerMessage,
        exclude: Option<ConnectionId>,
    ) {
        let Some(room) = self.rooms.get(document_id) else {
            return;
        };

        for member_id in &room.members {
            if Some(*member_id) == exclude {
                continue;
            }
            if let Some(connection) = self.connections.get(member_id) {
                if !connection.send(message.clone()) {
                    tracing::warn!(connection_id = %member_id, "broadcast send failed, recipient will resync on reconnect");
                }
            }
        }
    }

    pub fn get_connection(&self, connection_id: ConnectionId) -> Option<UserConnection> {
        self.connections.get(&connection_id).map(|c| c.clone())
    }

    pub fn get_document_connections(&self, document_id: &str) -> Vec<UserConnection> {
        let Some(room) = self.rooms.get(document_id) else {
            return Vec::new();
        };
        room.members
            .iter()
            .filter_map(|id| self.connections.get(id).map(|c| c.clone()))
            .collect()
    }

    pub fn get_document_user_count(&self, document_id: &str) -> usize {
        self.rooms.get(document_id).map(|r| r.members.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn sender() -> (OutboundSender, mpsc::UnboundedReceiver<ServerMessage>) {
        unbounded_channel()
    }

    #[tokio::test]
    async fn join_then_leave_removes_empty_room() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = sender();
        let conn = manager.add_connection("user1", tx);

        manager.join_document(conn.id, "doc1").await;
        assert_eq!(manager.get_document_user_count("doc1"), 1);

        manager.leave_document(conn.id, "doc1").await;
        assert_eq!(manager.get_document_user_count("doc1"), 0);
    }

    #[tokio::test]
    async fn joining_a_new_room_leaves_the_previous_one() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = sender();
        let conn = manager.add_connection("user1", tx);

        manager.join_document(conn.id, "doc1").await;
        manager.join_document(conn.id, "doc2").await;

        assert_eq!(manager.get_document_user_count("doc1"), 0);
        assert_eq!(manager.get_document_user_count("doc2"), 1);
        assert_eq!(
            manager.get_connection(conn.id).unwrap().document_id.as_deref(),
            Some("doc2")
        );
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_skips_other_rooms() {
        let manager = ConnectionManager::new();
        let (tx_a, mut rx_a) = sender();
        let (tx_b, mut rx_b) = sender();
        let (tx_c, mut rx_c) = sender();

        let a = manager.add_connection("user_a", tx_a);
        let b = manager.add_connection("user_b", tx_b);
        let c = manager.add_connection("user_c", tx_c);

        manager.join_document(a.id, "doc1").await;
        manager.join_document(b.id, "doc1").await;
        manager.join_document(c.id, "doc2").await;

        manager.broadcast_to_document("doc1", ServerMessage::Pong, Some(a.id));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_connection_clears_room_membership() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = sender();
        let conn = manager.add_connection("user1", tx);

        manager.join_document(conn.id, "doc1").await;
        manager.remove_connection(conn.id).await;

        assert_eq!(manager.get_document_user_count("doc1"), 0);
        assert!(manager.get_connection(conn.id).is_none());
    }
}
