//! WebSocket presence server with room-based roster broadcast.
//!
//! Architecture:
//! ```text
//! Tab A ──┐
//!          ├── Room (doc_id) ── RoomRegistry ── RoomChannels
//! Tab B ──┘                          │
//!                          ┌─────────┴─────────┐
//!                          ▼                   ▼
//!                        Tab A               Tab B
//! ```
//!
//! One task per connection. All membership mutations and their roster
//! broadcast happen under a single write lock on [`PresenceState`], so
//! "remove, maybe delete the empty room, broadcast" is atomic relative to
//! every other join/leave/disconnect. The broadcast send itself is a
//! synchronous channel push; actual WebSocket writes happen later in each
//! recipient's own task and never hold the lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomChannels;
use crate::protocol::{PresenceMessage, UserProfile};
use crate::registry::{Departure, RoomRegistry};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket heartbeat ping interval in seconds; bounds how long a
    /// ghost participant can outlive a dead network link
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4000".to_string(),
            broadcast_capacity: 64,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub broadcasts_sent: u64,
    pub active_rooms: usize,
}

/// Registry and fan-out channels, kept behind one lock so membership and
/// channel lifecycle can never drift apart.
struct PresenceState {
    registry: RoomRegistry,
    channels: RoomChannels,
}

impl PresenceState {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            registry: RoomRegistry::new(),
            channels: RoomChannels::new(broadcast_capacity),
        }
    }

    /// Encode the room's current roster and push it to every subscriber.
    ///
    /// The roster is read from the registry at this moment — under the
    /// same lock as the mutation that triggered it — so no broadcast can
    /// ever carry a list older than what the registry holds.
    fn broadcast_roster(&mut self, doc_id: &str) -> usize {
        let users = self.registry.roster(doc_id);
        let msg = PresenceMessage::UsersUpdated {
            doc_id: doc_id.to_string(),
            users,
        };
        match msg.encode() {
            Ok(bytes) => self.channels.send(doc_id, Arc::new(bytes)),
            Err(e) => {
                log::error!("Failed to encode roster for room {doc_id}: {e}");
                0
            }
        }
    }

    /// React to a connection having left a room: notify the remaining
    /// members, or tear the channel down if the room is gone.
    fn handle_departure(&mut self, departure: &Departure) -> usize {
        if departure.still_occupied {
            self.broadcast_roster(&departure.doc_id)
        } else {
            self.channels.remove(&departure.doc_id);
            log::info!("Room {} removed (empty)", departure.doc_id);
            0
        }
    }
}

/// The presence server.
pub struct PresenceServer {
    config: ServerConfig,
    state: Arc<RwLock<PresenceState>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl PresenceServer {
    /// Create a new presence server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let state = PresenceState::new(config.broadcast_capacity);
        Self {
            config,
            state: Arc::new(RwLock::new(state)),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Presence server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, state, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    ///
    /// The cleanup at the bottom runs on every exit path — clean close,
    /// protocol error, failed write, dead heartbeat — so a connection can
    /// never end without its room membership being reclaimed.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<RwLock<PresenceState>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn_id = Uuid::new_v4();
        log::info!("Connection {conn_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Roster receiver for the room this connection is currently in.
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Swallow the immediate first tick so pings start one interval in.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match PresenceMessage::decode(&bytes) {
                                Ok(PresenceMessage::JoinDocument { doc_id, user }) => {
                                    if let Some(rx) = Self::handle_join(
                                        conn_id, &doc_id, user, &state, &stats,
                                    ).await {
                                        broadcast_rx = Some(rx);
                                    }
                                }

                                Ok(PresenceMessage::LeaveDocument) => {
                                    broadcast_rx = None;
                                    Self::handle_leave(conn_id, &state, &stats).await;
                                }

                                Ok(PresenceMessage::Ping) => {
                                    let pong = match PresenceMessage::Pong.encode() {
                                        Ok(p) => p,
                                        Err(e) => {
                                            log::error!("Failed to encode pong: {e}");
                                            continue;
                                        }
                                    };
                                    if ws_sender.send(Message::Binary(pong.into())).await.is_err() {
                                        break;
                                    }
                                }

                                Ok(other) => {
                                    log::debug!("Ignoring unexpected message from {conn_id}: {other:?}");
                                }

                                Err(e) => {
                                    // Malformed frames are dropped, never answered:
                                    // presence is best-effort and raises nothing
                                    // back across the wire.
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing roster broadcast for our current room
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not in a room — wait forever
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(data) => {
                            if ws_sender.send(Message::Binary(data.to_vec().into())).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // A laggard missed intermediate rosters; the next
                            // recv yields a newer one, so membership still
                            // converges without regression.
                            log::warn!("Connection {conn_id} lagged by {n} roster updates");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            broadcast_rx = None;
                        }
                    }
                }

                // Transport-level liveness probe
                _ = heartbeat.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        log::info!("Heartbeat failed for connection {conn_id}, dropping");
                        break;
                    }
                }
            }
        }

        // Cleanup: transport gone, identical to an explicit leave.
        Self::handle_leave(conn_id, &state, &stats).await;

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        Ok(())
    }

    /// Join handling: one atomic registry mutation plus broadcasts, under
    /// a single write lock. Returns the roster receiver for the new room,
    /// or `None` when the join was rejected.
    async fn handle_join(
        conn_id: Uuid,
        doc_id: &str,
        user: UserProfile,
        state: &Arc<RwLock<PresenceState>>,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> {
        let display_name = user.name.clone();
        let mut st = state.write().await;

        let outcome = match st.registry.join(conn_id, doc_id, user) {
            Some(o) => o,
            None => {
                log::warn!("Connection {conn_id} sent join with empty doc id, ignoring");
                return None;
            }
        };

        let mut broadcasts = 0u64;

        // A room switch vacates the old room; its remaining members learn
        // about it now. A rejoin of the same room needs no extra notice —
        // the join broadcast below already carries the fresh roster.
        if let Some(departure) = &outcome.vacated {
            if departure.doc_id != doc_id {
                if st.handle_departure(departure) > 0 {
                    broadcasts += 1;
                }
            }
        }

        // Subscribe before broadcasting so the joiner sees its own update.
        let rx = st.channels.subscribe(doc_id);
        if st.broadcast_roster(doc_id) > 0 {
            broadcasts += 1;
        }

        let room_count = st.registry.room_count();
        drop(st);

        log::info!("Connection {conn_id} ({display_name}) joined room {doc_id}");

        let mut s = stats.write().await;
        s.broadcasts_sent += broadcasts;
        s.active_rooms = room_count;

        Some(rx)
    }

    /// Leave/disconnect handling. Idempotent: a connection not in any
    /// room is a silent no-op.
    async fn handle_leave(
        conn_id: Uuid,
        state: &Arc<RwLock<PresenceState>>,
        stats: &Arc<RwLock<ServerStats>>,
    ) {
        let mut st = state.write().await;
        let departure = match st.registry.remove(conn_id) {
            Some(d) => d,
            None => return,
        };

        let broadcasted = st.handle_departure(&departure) > 0;
        let room_count = st.registry.room_count();
        drop(st);

        log::info!("Connection {conn_id} left room {}", departure.doc_id);

        let mut s = stats.write().await;
        if broadcasted {
            s.broadcasts_sent += 1;
        }
        s.active_rooms = room_count;
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Ids of all currently active (non-empty) rooms.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.state.read().await.registry.active_rooms()
    }

    /// Number of active rooms.
    pub async fn room_count(&self) -> usize {
        self.state.read().await.registry.room_count()
    }

    /// Current roster of a room (empty for unknown rooms).
    pub async fn roster(&self, doc_id: &str) -> Vec<UserProfile> {
        self.state.read().await.registry.roster(doc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:4000");
        assert_eq!(config.broadcast_capacity, 64);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_server_creation() {
        let server = PresenceServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:4000");
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            broadcast_capacity: 128,
            heartbeat_interval_secs: 15,
        };
        let server = PresenceServer::new(config);
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = PresenceServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.broadcasts_sent, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_server_initially_no_rooms() {
        let server = PresenceServer::with_defaults();
        assert_eq!(server.room_count().await, 0);
        assert!(server.active_rooms().await.is_empty());
        assert!(server.roster("doc1").await.is_empty());
    }

    #[tokio::test]
    async fn test_state_join_and_broadcast() {
        let state = Arc::new(RwLock::new(PresenceState::new(16)));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let conn = Uuid::new_v4();

        let rx = PresenceServer::handle_join(
            conn,
            "doc1",
            UserProfile::new("Alice", "a.png"),
            &state,
            &stats,
        )
        .await;
        let mut rx = rx.expect("join should be accepted");

        // The joiner's own receiver carries the fresh roster.
        let payload = rx.try_recv().unwrap();
        match PresenceMessage::decode(&payload).unwrap() {
            PresenceMessage::UsersUpdated { doc_id, users } => {
                assert_eq!(doc_id, "doc1");
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].name, "Alice");
            }
            other => panic!("Expected UsersUpdated, got {other:?}"),
        }

        assert_eq!(stats.read().await.broadcasts_sent, 1);
        assert_eq!(stats.read().await.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_state_empty_doc_id_rejected() {
        let state = Arc::new(RwLock::new(PresenceState::new(16)));
        let stats = Arc::new(RwLock::new(ServerStats::default()));

        let rx = PresenceServer::handle_join(
            Uuid::new_v4(),
            "",
            UserProfile::new("Alice", "a.png"),
            &state,
            &stats,
        )
        .await;

        assert!(rx.is_none());
        assert_eq!(state.read().await.registry.room_count(), 0);
        assert_eq!(stats.read().await.broadcasts_sent, 0);
    }

    #[tokio::test]
    async fn test_state_leave_gc_and_no_broadcast_to_empty_room() {
        let state = Arc::new(RwLock::new(PresenceState::new(16)));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let conn = Uuid::new_v4();

        let _rx = PresenceServer::handle_join(
            conn,
            "doc1",
            UserProfile::new("Alice", "a.png"),
            &state,
            &stats,
        )
        .await
        .unwrap();

        PresenceServer::handle_leave(conn, &state, &stats).await;

        let st = state.read().await;
        assert!(!st.registry.contains_room("doc1"));
        assert_eq!(st.channels.channel_count(), 0);
        drop(st);

        // Only the join broadcast happened; the departure of the last
        // member produces none.
        assert_eq!(stats.read().await.broadcasts_sent, 1);
        assert_eq!(stats.read().await.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_state_leave_idempotent() {
        let state = Arc::new(RwLock::new(PresenceState::new(16)));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let conn = Uuid::new_v4();

        // Leave without ever joining: silent no-op.
        PresenceServer::handle_leave(conn, &state, &stats).await;
        assert_eq!(stats.read().await.broadcasts_sent, 0);
    }

    #[tokio::test]
    async fn test_state_room_switch_notifies_old_room() {
        let state = Arc::new(RwLock::new(PresenceState::new(16)));
        let stats = Arc::new(RwLock::new(ServerStats::default()));
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        let mut rx1 = PresenceServer::handle_join(
            c1,
            "docA",
            UserProfile::new("Alice", "a.png"),
            &state,
            &stats,
        )
        .await
        .unwrap();

        let _rx2 = PresenceServer::handle_join(
            c2,
            "docA",
            UserProfile::new("Bob", "b.png"),
            &state,
            &stats,
        )
        .await
        .unwrap();

        // Drain Alice's pending rosters (her own join, then Bob's).
        let _ = rx1.try_recv().unwrap();
        let _ = rx1.try_recv().unwrap();

        // Bob switches to docB: Alice must see a one-person roster.
        let _rx2b = PresenceServer::handle_join(
            c2,
            "docB",
            UserProfile::new("Bob", "b.png"),
            &state,
            &stats,
        )
        .await
        .unwrap();

        let payload = rx1.try_recv().unwrap();
        match PresenceMessage::decode(&payload).unwrap() {
            PresenceMessage::UsersUpdated { doc_id, users } => {
                assert_eq!(doc_id, "docA");
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].name, "Alice");
            }
            other => panic!("Expected UsersUpdated, got {other:?}"),
        }

        let st = state.read().await;
        assert_eq!(st.registry.participant_count("docA"), 1);
        assert_eq!(st.registry.participant_count("docB"), 1);
    }
}
