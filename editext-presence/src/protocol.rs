//! Binary wire protocol for presence coordination.
//!
//! Messages are bincode-encoded and carried in binary WebSocket frames.
//! The surface is deliberately small: a client announces which document it
//! is viewing, the server answers every membership change with the full
//! roster of that document's room.
//!
//! Document ids are opaque strings owned by the document store; this layer
//! never interprets them. The display identity inside a join is taken
//! verbatim from the client — authentication happens upstream, before the
//! client ever opens a presence connection.

use serde::{Deserialize, Serialize};

/// Display identity attached to a connection at join time.
///
/// Fixed for the lifetime of the connection. The same human opening two
/// tabs shows up as two profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    /// Avatar image reference (URL or asset key), passed through untouched.
    pub avatar: String,
}

impl UserProfile {
    pub fn new(name: impl Into<String>, avatar: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar: avatar.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceMessage {
    /// Client → server: attach this connection to a document room.
    ///
    /// A connection belongs to at most one room; joining while already in
    /// a different room vacates the old room first.
    JoinDocument { doc_id: String, user: UserProfile },

    /// Client → server: detach from the current room, if any.
    ///
    /// Transport close has the same effect; an explicit leave just makes
    /// the departure visible without tearing the connection down.
    LeaveDocument,

    /// Server → client: the full roster of a room after a membership
    /// change. Recomputed from the registry on every send, never cached.
    UsersUpdated {
        doc_id: String,
        users: Vec<UserProfile>,
    },

    /// Application-level liveness probe.
    Ping,
    /// Answer to [`PresenceMessage::Ping`].
    Pong,
}

impl PresenceMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
