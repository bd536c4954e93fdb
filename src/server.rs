//! `WebSocketServer`: the authenticated wire-protocol endpoint (spec
//! §4.5). Built directly on `tokio-tungstenite` + `futures-util`, one
//! spawned task per accepted connection, matching the teacher's
//! pattern in `main.rs` of running the signaling server as a
//! background `tokio::spawn`ed task.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionManager};
use crate::metrics::Metrics;
use crate::protocol::{
    ClientMessage, JoinDocumentMessage, LeaveDocumentMessage, OperationMessage, PresenceMessage,
    PresenceStatus, ServerMessage, SyncResponseMessage, UserSummary,
};
use crate::vector_clock::VectorClock;

/// Resolves a bearer token to a user id, or `None` to reject. Boxed so
/// the binary can supply any async closure (real token issuance is out
/// of scope for this crate — spec §1).
pub type AuthValidator =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

enum ConnState {
    Unauthenticated,
    Authenticated { connection_id: ConnectionId },
}

pub struct WebSocketServer {
    config: ServerConfig,
    auth_validator: AuthValidator,
    connections: Arc<ConnectionManager>,
    metrics: Arc<Metrics>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig, auth_validator: AuthValidator) -> Self {
        Self {
            config,
            auth_validator,
            connections: ConnectionManager::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connections)
    }

    /// Binds `config.port` and accepts connections until the process is
    /// killed. Each connection gets its own task; a failure on one
    /// never affects the others (spec §7 transport-fault policy).
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "collaboration server listening");

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.accept_connection(stream, peer_addr).await {
                    tracing::warn!(%peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }

    async fn accept_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let origins = self.config.allowed_origins.clone();
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
            let origin = req
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok());
            let allowed = match origin {
                None => true,
                Some(origin) => origins.iter().any(|o| o == "*" || o == origin),
            };
            if allowed {
                Ok(resp)
            } else {
                Err(Response::builder()
                    .status(403)
                    .body(None)
                    .expect("static 403 response is well-formed"))
            }
        })
        .await?;

        self.metrics.record_connection_opened();
        let result = self.serve(ws_stream).await;
        self.metrics.record_connection_closed();
        tracing::info!(%peer_addr, "connection disconnected");
        result
    }

    async fn serve(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    ) -> anyhow::Result<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let mut state = ConnState::Unauthenticated;

        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => {
                    let Some(message) = outgoing else { break };
                    if send_json(&mut ws_sender, &message).await.is_err() {
                        break;
                    }
                }
                incoming = ws_receiver.next() => {
                    let Some(frame) = incoming else { break };
                    let frame = frame?;
                    match frame {
                        Message::Text(text) => {
                            if !self.handle_frame(&text, &mut state, &outbound_tx).await {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        if let ConnState::Authenticated { connection_id } = state {
            self.connections.remove_connection(connection_id).await;
        }

        Ok(())
    }

    /// Returns `false` when the connection should be torn down.
    async fn handle_frame(
        &self,
        text: &str,
        state: &mut ConnState,
        outbound_tx: &mpsc::UnboundedSender<ServerMessage>,
    ) -> bool {
        let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
        let message = match parsed {
            Ok(m) => m,
            Err(_) => {
                let _ = outbound_tx.send(ServerMessage::Error {
                    error: "Invalid message format".to_string(),
                });
                return true;
            }
        };

        match state {
            ConnState::Unauthenticated => self.handle_unauthenticated(message, state, outbound_tx).await,
            ConnState::Authenticated { connection_id } => {
                let connection_id = *connection_id;
                self.handle_authenticated(message, connection_id, outbound_tx).await;
                true
            }
        }
    }

    async fn handle_unauthenticated(
        &self,
        message: ClientMessage,
        state: &mut ConnState,
        outbound_tx: &mpsc::UnboundedSender<ServerMessage>,
    ) -> bool {
        match message {
            ClientMessage::Auth { token } => {
                match (self.auth_validator)(token).await {
                    Some(user_id) => {
                        let connection = self.connections.add_connection(user_id.clone(), outbound_tx.clone());
                        *state = ConnState::Authenticated {
                            connection_id: connection.id,
                        };
                        let _ = outbound_tx.send(ServerMessage::AuthSuccess { user_id });
                    }
                    None => {
                        let _ = outbound_tx.send(ServerMessage::AuthError {
                            error: "Invalid token".to_string(),
                            reason: None,
                        });
                    }
                }
                true
            }
            _ => {
                let _ = outbound_tx.send(ServerMessage::AuthError {
                    error: "Not authenticated".to_string(),
                    reason: None,
                });
                true
            }
        }
    }

    async fn handle_authenticated(
        &self,
        message: ClientMessage,
        connection_id: ConnectionId,
        outbound_tx: &mpsc::UnboundedSender<ServerMessage>,
    ) {
        let Some(connection) = self.connections.get_connection(connection_id) else {
            return;
        };
        let authenticated_user_id = connection.user_id.clone();

        match message {
            ClientMessage::Auth { .. } => {
                // Already authenticated; a repeated AUTH is ignored rather than re-validated.
            }
            ClientMessage::JoinDocument(JoinDocumentMessage { document_id, .. }) => {
                self.connections.join_document(connection_id, document_id.clone()).await;

                self.connections.broadcast_to_document(
                    &document_id,
                    ServerMessage::Presence(PresenceMessage {
                        user_id: authenticated_user_id.clone(),
                        timestamp: now_ms(),
                        status: PresenceStatus::Active,
                    }),
                    Some(connection_id),
                );

                let users = self
                    .connections
                    .get_document_connections(&document_id)
                    .into_iter()
                    .map(|c| UserSummary {
                        user_id: c.user_id,
                        display_name: None,
                        avatar_url: None,
                        color: None,
                        status: None,
                        last_seen: None,
                        cursor: None,
                    })
                    .collect();
                let _ = outbound_tx.send(ServerMessage::UserList { users });
            }
            ClientMessage::LeaveDocument(LeaveDocumentMessage { document_id, .. }) => {
                self.connections.broadcast_to_document(
                    &document_id,
                    ServerMessage::Presence(PresenceMessage {
                        user_id: authenticated_user_id.clone(),
                        timestamp: now_ms(),
                        status: PresenceStatus::Offline,
                    }),
                    Some(connection_id),
                );
                self.connections.leave_document(connection_id, &document_id).await;
            }
            ClientMessage::Operation(mut op_msg) => {
                if op_msg.user_id != authenticated_user_id {
                    let _ = outbound_tx.send(ServerMessage::Error {
                        error: "userId does not match authenticated identity".to_string(),
                    });
                    return;
                }
                let latency = crate::metrics::LatencyTracker::new();
                op_msg.user_id = authenticated_user_id.clone();
                op_msg.operation.user_id = authenticated_user_id.clone();
                op_msg.timestamp = now_ms();
                op_msg.operation.timestamp = op_msg.timestamp;
                let document_id = op_msg.document_id.clone();
                self.connections
                    .broadcast_to_document(&document_id, ServerMessage::Operation(op_msg), Some(connection_id));
                self.metrics.record_operation(latency.elapsed_ms());
            }
            ClientMessage::CursorPosition(mut cursor_msg) => {
                if cursor_msg.user_id != authenticated_user_id {
                    return;
                }
                cursor_msg.timestamp = now_ms();
                let document_id = cursor_msg.document_id.clone();
                self.connections.broadcast_to_document(
                    &document_id,
                    ServerMessage::CursorPosition(cursor_msg),
                    Some(connection_id),
                );
            }
            ClientMessage::Selection(mut selection_msg) => {
                if selection_msg.user_id != authenticated_user_id {
                    return;
                }
                selection_msg.timestamp = now_ms();
                let document_id = selection_msg.document_id.clone();
                self.connections.broadcast_to_document(
                    &document_id,
                    ServerMessage::Selection(selection_msg),
                    Some(connection_id),
                );
            }
            ClientMessage::Presence(presence_msg) => {
                let Some(document_id) = connection.document_id.clone() else {
                    return;
                };
                self.connections.broadcast_to_document(
                    &document_id,
                    ServerMessage::Presence(PresenceMessage {
                        user_id: authenticated_user_id,
                        timestamp: now_ms(),
                        status: presence_msg.status,
                    }),
                    Some(connection_id),
                );
            }
            ClientMessage::SyncRequest(req) => {
                // Stateless with respect to document content (spec §4.5,
                // §9): a durable-store collaborator can substitute a real
                // operation log here without changing the wire shape.
                let _ = outbound_tx.send(ServerMessage::SyncResponse(SyncResponseMessage {
                    document_id: req.document_id,
                    operations: Vec::new(),
                    current_vector_clock: VectorClock::new(),
                    timestamp: now_ms(),
                }));
            }
            ClientMessage::Ping => {
                let _ = outbound_tx.send(ServerMessage::Pong);
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn send_json(
    sender: &mut futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        Message,
    >,
    message: &ServerMessage,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    sender.send(Message::Text(text)).await?;
    Ok(())
}
