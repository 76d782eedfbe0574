//! In-memory room registry: the authoritative doc_id → participants mapping.
//!
//! The registry is plain synchronous state with no I/O. The server owns
//! exactly one instance behind a single write lock, so every membership
//! mutation — remove, garbage-collect the room if empty, broadcast — is one
//! atomic step relative to all other events. Nothing outside the
//! join/leave/disconnect handlers touches it.
//!
//! Invariants maintained here:
//! - a room with zero participants is never present in the map (the entry
//!   is deleted the moment its last member goes)
//! - a connection is a member of at most one room at any time
//! - all hot-path operations are O(1) map lookups; no scan over rooms

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::protocol::UserProfile;

/// Per-connection record: which room the connection is in, and the display
/// identity it joined with. Looked up by connection id on leave/disconnect
/// instead of scanning rooms.
#[derive(Debug, Clone)]
struct ConnectionRecord {
    doc_id: String,
    user: UserProfile,
}

/// The room a connection was removed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub doc_id: String,
    /// False when the departing connection was the last member and the
    /// room entry has been deleted from the registry.
    pub still_occupied: bool,
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The previous room this connection was vacated from, if it was
    /// already a member somewhere when the join arrived.
    pub vacated: Option<Departure>,
}

/// Mapping from document id to the set of connections viewing it.
///
/// Rooms are created implicitly on first join and deleted implicitly when
/// the last participant leaves.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, HashSet<Uuid>>,
    connections: HashMap<Uuid, ConnectionRecord>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection to a room with the given identity.
    ///
    /// If the connection is already a member of any room (including the
    /// same one, e.g. a client re-emitting its join on reconnect), the old
    /// membership is cleared first so the single-room invariant holds.
    ///
    /// Returns `None` when `doc_id` is empty: the join is a silent no-op
    /// and no room is created.
    pub fn join(&mut self, conn_id: Uuid, doc_id: &str, user: UserProfile) -> Option<JoinOutcome> {
        if doc_id.is_empty() {
            return None;
        }

        let vacated = self.remove(conn_id);

        self.rooms.entry(doc_id.to_string()).or_default().insert(conn_id);
        self.connections.insert(
            conn_id,
            ConnectionRecord {
                doc_id: doc_id.to_string(),
                user,
            },
        );

        Some(JoinOutcome { vacated })
    }

    /// Detach a connection from whatever room it is in.
    ///
    /// Idempotent: removing a connection that is not in any room returns
    /// `None` and changes nothing. Deletes the room entry when the set
    /// becomes empty.
    pub fn remove(&mut self, conn_id: Uuid) -> Option<Departure> {
        let record = self.connections.remove(&conn_id)?;

        let still_occupied = match self.rooms.get_mut(&record.doc_id) {
            Some(members) => {
                members.remove(&conn_id);
                if members.is_empty() {
                    self.rooms.remove(&record.doc_id);
                    false
                } else {
                    true
                }
            }
            None => false,
        };

        Some(Departure {
            doc_id: record.doc_id,
            still_occupied,
        })
    }

    /// The current roster of a room, computed fresh from the registry.
    ///
    /// Order is arbitrary but fixed for the duration of one call; callers
    /// must not rely on it between calls. An unknown room yields an empty
    /// roster.
    pub fn roster(&self, doc_id: &str) -> Vec<UserProfile> {
        match self.rooms.get(doc_id) {
            Some(members) => members
                .iter()
                .filter_map(|id| self.connections.get(id))
                .map(|rec| rec.user.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The room a connection currently belongs to.
    pub fn connection_room(&self, conn_id: Uuid) -> Option<&str> {
        self.connections.get(&conn_id).map(|r| r.doc_id.as_str())
    }

    /// Whether a room exists (i.e. has at least one participant).
    pub fn contains_room(&self, doc_id: &str) -> bool {
        self.rooms.contains_key(doc_id)
    }

    /// Number of participants in a room (0 for unknown rooms).
    pub fn participant_count(&self, doc_id: &str) -> usize {
        self.rooms.get(doc_id).map_or(0, |m| m.len())
    }

    /// Number of active (non-empty) rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total number of connections currently in some room.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Ids of all active rooms.
    pub fn active_rooms(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserProfile {
        UserProfile::new("Alice", "a.png")
    }

    fn bob() -> UserProfile {
        UserProfile::new("Bob", "b.png")
    }

    #[test]
    fn test_join_creates_room() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();

        let outcome = reg.join(c1, "doc1", alice()).unwrap();
        assert!(outcome.vacated.is_none());
        assert!(reg.contains_room("doc1"));
        assert_eq!(reg.participant_count("doc1"), 1);
        assert_eq!(reg.connection_room(c1), Some("doc1"));
    }

    #[test]
    fn test_join_empty_doc_id_rejected() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();

        assert!(reg.join(c1, "", alice()).is_none());
        assert_eq!(reg.room_count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn test_roster_reflects_members() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        reg.join(c1, "doc1", alice()).unwrap();
        reg.join(c2, "doc1", bob()).unwrap();

        let roster = reg.roster("doc1");
        assert_eq!(roster.len(), 2);
        let names: Vec<&str> = roster.iter().map(|u| u.name.as_str()).collect();
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
    }

    #[test]
    fn test_roster_unknown_room_empty() {
        let reg = RoomRegistry::new();
        assert!(reg.roster("nowhere").is_empty());
    }

    // No ghosts: after any sequence of joins/removes, the roster equals
    // exactly the set of connections still joined.
    #[test]
    fn test_no_ghost_participants() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let c3 = Uuid::new_v4();

        reg.join(c1, "doc1", alice()).unwrap();
        reg.join(c2, "doc1", bob()).unwrap();
        reg.join(c3, "doc1", UserProfile::new("Carol", "c.png")).unwrap();
        reg.remove(c2);

        let names: Vec<String> = reg.roster("doc1").into_iter().map(|u| u.name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Alice".to_string()));
        assert!(names.contains(&"Carol".to_string()));
        assert!(!names.contains(&"Bob".to_string()));
    }

    // Empty-room GC: the last departure deletes the room entry itself,
    // not merely its members.
    #[test]
    fn test_empty_room_garbage_collected() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();

        reg.join(c1, "doc1", alice()).unwrap();
        let dep = reg.remove(c1).unwrap();

        assert_eq!(dep.doc_id, "doc1");
        assert!(!dep.still_occupied);
        assert!(!reg.contains_room("doc1"));
        assert_eq!(reg.room_count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }

    // Single-room invariant: joining room B while in room A vacates A.
    #[test]
    fn test_join_vacates_previous_room() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        reg.join(c2, "docA", bob()).unwrap();
        reg.join(c1, "docA", alice()).unwrap();
        let outcome = reg.join(c1, "docB", alice()).unwrap();

        let vacated = outcome.vacated.unwrap();
        assert_eq!(vacated.doc_id, "docA");
        assert!(vacated.still_occupied); // Bob remains

        assert_eq!(reg.participant_count("docA"), 1);
        assert_eq!(reg.participant_count("docB"), 1);
        assert_eq!(reg.connection_room(c1), Some("docB"));
    }

    #[test]
    fn test_join_vacates_and_collects_previous_room() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();

        reg.join(c1, "docA", alice()).unwrap();
        let outcome = reg.join(c1, "docB", alice()).unwrap();

        let vacated = outcome.vacated.unwrap();
        assert_eq!(vacated.doc_id, "docA");
        assert!(!vacated.still_occupied);
        assert!(!reg.contains_room("docA"));
        assert!(reg.contains_room("docB"));
    }

    // Double join into the same room is treated as a fresh first join.
    #[test]
    fn test_rejoin_same_room() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();

        reg.join(c1, "doc1", alice()).unwrap();
        let outcome = reg.join(c1, "doc1", alice()).unwrap();

        // The reconnect-style rejoin vacates and re-enters the same room.
        assert_eq!(outcome.vacated.unwrap().doc_id, "doc1");
        assert_eq!(reg.participant_count("doc1"), 1);
        assert_eq!(reg.roster("doc1").len(), 1);
    }

    // Idempotent leave: a second remove is a no-op, not an error.
    #[test]
    fn test_remove_idempotent() {
        let mut reg = RoomRegistry::new();
        let c1 = Uuid::new_v4();

        reg.join(c1, "doc1", alice()).unwrap();
        assert!(reg.remove(c1).is_some());
        assert!(reg.remove(c1).is_none());
    }

    #[test]
    fn test_remove_never_joined() {
        let mut reg = RoomRegistry::new();
        assert!(reg.remove(Uuid::new_v4()).is_none());
        assert_eq!(reg.room_count(), 0);
    }

    // Two tabs of the same human are two independent participants.
    #[test]
    fn test_same_identity_two_connections() {
        let mut reg = RoomRegistry::new();
        let tab1 = Uuid::new_v4();
        let tab2 = Uuid::new_v4();

        reg.join(tab1, "doc1", alice()).unwrap();
        reg.join(tab2, "doc1", alice()).unwrap();

        assert_eq!(reg.participant_count("doc1"), 2);

        reg.remove(tab1);
        assert_eq!(reg.participant_count("doc1"), 1);
        assert_eq!(reg.roster("doc1")[0].name, "Alice");
    }

    #[test]
    fn test_active_rooms() {
        let mut reg = RoomRegistry::new();
        reg.join(Uuid::new_v4(), "doc1", alice()).unwrap();
        reg.join(Uuid::new_v4(), "doc2", bob()).unwrap();

        let rooms = reg.active_rooms();
        assert_eq!(rooms.len(), 2);
        assert!(rooms.contains(&"doc1".to_string()));
        assert!(rooms.contains(&"doc2".to_string()));
    }
}
