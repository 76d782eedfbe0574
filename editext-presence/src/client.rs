//! WebSocket presence client for the editor front end.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Join/leave for the document the tab is viewing
//! - A stream of roster updates for rendering the avatar list
//! - Rejoin-on-reconnect: the server keeps no per-client state across a
//!   drop, so the client remembers its last join and re-emits it when the
//!   transport comes back.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{PresenceMessage, ProtocolError, UserProfile};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the presence client.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The roster of our room changed
    UsersUpdated {
        doc_id: String,
        users: Vec<UserProfile>,
    },
    /// Answer to an application-level ping
    Pong,
}

/// The presence client.
///
/// One instance per browser tab / editor session. The display identity is
/// fixed at construction; the document being viewed may change over the
/// connection's lifetime, one at a time.
pub struct PresenceClient {
    /// Our display identity, sent verbatim with every join
    user: UserProfile,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// The document we are currently viewing (survives reconnects)
    current_doc: Arc<RwLock<Option<String>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<PresenceEvent>>,

    /// Event sender (held by connection tasks)
    event_tx: mpsc::Sender<PresenceEvent>,

    /// Server URL
    server_url: String,
}

impl PresenceClient {
    /// Create a new presence client.
    pub fn new(user: UserProfile, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        Self {
            user,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            current_doc: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<PresenceEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    /// If a document was joined before (or during a previous connection),
    /// the join is re-emitted immediately.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_result = tokio_tungstenite::connect_async(&self.server_url).await;

        let (ws_stream, _) = match ws_result {
            Ok(ok) => ok,
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(PresenceEvent::Connected).await;

        // Rejoin the document we were in before the drop, if any.
        let rejoin = self.current_doc.read().await.clone();
        if let Some(doc_id) = rejoin {
            log::info!("Rejoining document {doc_id} after reconnect");
            self.send_message(&PresenceMessage::JoinDocument {
                doc_id,
                user: self.user.clone(),
            })
            .await?;
        }

        // Reader task: decode incoming frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match PresenceMessage::decode(&bytes) {
                            Ok(PresenceMessage::UsersUpdated { doc_id, users }) => {
                                let _ = event_tx
                                    .send(PresenceEvent::UsersUpdated { doc_id, users })
                                    .await;
                            }
                            Ok(PresenceMessage::Pong) => {
                                let _ = event_tx.send(PresenceEvent::Pong).await;
                            }
                            Ok(other) => {
                                log::debug!("Ignoring unexpected server message: {other:?}");
                            }
                            Err(e) => {
                                log::warn!("Failed to decode server message: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(PresenceEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Start viewing a document.
    ///
    /// Remembered across reconnects. When currently disconnected this just
    /// records the document; the next `connect()` emits the join.
    pub async fn join_document(&self, doc_id: impl Into<String>) -> Result<(), ProtocolError> {
        let doc_id = doc_id.into();
        *self.current_doc.write().await = Some(doc_id.clone());

        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }

        self.send_message(&PresenceMessage::JoinDocument {
            doc_id,
            user: self.user.clone(),
        })
        .await
    }

    /// Stop viewing the current document without closing the connection.
    pub async fn leave_document(&self) -> Result<(), ProtocolError> {
        *self.current_doc.write().await = None;

        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }

        self.send_message(&PresenceMessage::LeaveDocument).await
    }

    /// Send an application-level ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_message(&PresenceMessage::Ping).await
    }

    /// Close the connection cleanly.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn send_message(&self, msg: &PresenceMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::Binary(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The document currently being viewed, if any.
    pub async fn current_document(&self) -> Option<String> {
        self.current_doc.read().await.clone()
    }

    /// Get our display identity.
    pub fn user(&self) -> &UserProfile {
        &self.user
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
