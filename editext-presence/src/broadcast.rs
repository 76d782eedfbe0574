//! Per-room fan-out channels for roster broadcasts.
//!
//! Each active room owns one tokio broadcast channel; every connection in
//! the room subscribes a receiver at join time. Sending is O(1) to all
//! subscribers, payloads are shared as `Arc<Vec<u8>>` so one encoded
//! roster serves every recipient without copies.
//!
//! This struct is plain synchronous state: the server owns it next to the
//! `RoomRegistry` behind the same lock, so channel creation/removal stays
//! in step with room creation/removal. A lagging subscriber drops old
//! messages from its own buffer and never blocks the sender — a dead
//! recipient is cleaned up by its own disconnect, not here.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Doc id → broadcast sender for that room's roster updates.
pub struct RoomChannels {
    channels: HashMap<String, broadcast::Sender<Arc<Vec<u8>>>>,
    capacity: usize,
}

impl RoomChannels {
    /// `capacity` is the per-subscriber buffer: how many broadcasts a slow
    /// connection may fall behind before it starts missing intermediate
    /// rosters (it still converges on the latest).
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: HashMap::new(),
            capacity,
        }
    }

    /// Subscribe a connection to a room, creating the channel on first use.
    ///
    /// Only messages sent after this call are delivered to the returned
    /// receiver, so subscribing before the join broadcast is what lets the
    /// joiner see its own roster update.
    pub fn subscribe(&mut self, doc_id: &str) -> broadcast::Receiver<Arc<Vec<u8>>> {
        match self.channels.get(doc_id) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                self.channels.insert(doc_id.to_string(), sender);
                receiver
            }
        }
    }

    /// Send an encoded payload to every subscriber of a room.
    ///
    /// Returns the number of receivers it reached; 0 for an unknown room
    /// or a room whose subscribers are all gone.
    pub fn send(&self, doc_id: &str, payload: Arc<Vec<u8>>) -> usize {
        match self.channels.get(doc_id) {
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop a room's channel. Called when the registry deletes the room.
    pub fn remove(&mut self, doc_id: &str) -> bool {
        self.channels.remove(doc_id).is_some()
    }

    /// Number of rooms with a live channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
