//! # editext-presence — Real-time presence coordination for Editext
//!
//! Tracks which connections are currently viewing which document and keeps
//! every member of a document "room" informed of who else is present.
//! Presence is advisory UI state: nothing here is persisted, and a process
//! restart simply requires clients to rejoin.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket       ┌─────────────────┐
//! │ PresenceClient │ ◄──────────────────► │ PresenceServer  │
//! │ (per tab)      │    Binary Proto      │ (central)       │
//! └────────────────┘                      └────────┬────────┘
//!                                                  │
//!                                         ┌────────┴────────┐
//!                                         │  RoomRegistry   │
//!                                         │ doc_id → conns  │
//!                                         └────────┬────────┘
//!                                                  │
//!                                         ┌────────┴────────┐
//!                                         │  RoomChannels   │
//!                                         │ roster fan-out  │
//!                                         └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded PresenceMessage)
//! - [`registry`] — In-memory room → participant mapping
//! - [`broadcast`] — Per-room fan-out channels
//! - [`server`] — WebSocket presence server
//! - [`client`] — WebSocket presence client with rejoin-on-reconnect

pub mod protocol;
pub mod registry;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{PresenceMessage, ProtocolError, UserProfile};
pub use registry::{Departure, JoinOutcome, RoomRegistry};
pub use broadcast::RoomChannels;
pub use server::{PresenceServer, ServerConfig, ServerStats};
pub use client::{ConnectionState, PresenceClient, PresenceEvent};
