//! Connection registry for session, room, and display-name tracking.
//!
//! The registry maintains bidirectional mappings: room → sessions (for
//! broadcast) and session → current room (for cleanup on disconnect). A
//! session occupies at most one room at a time, so entering a room vacates
//! the previous one.
//!
//! Display names are claimed here too: a reverse name → session index keeps
//! live names unique and makes name lookup O(1).

use std::collections::{HashMap, HashSet};

/// Registry for live connections.
///
/// Tracks only volatile state. Durable membership lives in storage; this
/// index answers "which sockets get this broadcast" and "is this name
/// currently in use".
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Room name → set of session IDs currently in it
    room_sessions: HashMap<String, HashSet<u64>>,
    /// Session ID → room it currently occupies
    session_room: HashMap<u64, String>,
    /// Display name → session ID holding it. Enforces live-name uniqueness
    name_sessions: HashMap<String, u64>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a display name for a session.
    ///
    /// Returns `false` if another live session already holds the name.
    pub fn claim_name(&mut self, name: &str, session_id: u64) -> bool {
        if self.name_sessions.contains_key(name) {
            return false;
        }
        self.name_sessions.insert(name.to_string(), session_id);
        true
    }

    /// Release a display name, making it available again.
    ///
    /// Returns `true` if the name was held.
    pub fn release_name(&mut self, name: &str) -> bool {
        self.name_sessions.remove(name).is_some()
    }

    /// Whether a display name is currently held by a live session.
    pub fn name_taken(&self, name: &str) -> bool {
        self.name_sessions.contains_key(name)
    }

    /// Move a session into a room.
    ///
    /// Returns the room the session vacated, if it was in one. Entering the
    /// room it is already in is a no-op returning `None`.
    pub fn enter(&mut self, session_id: u64, room: &str) -> Option<String> {
        if self.session_room.get(&session_id).is_some_and(|r| r == room) {
            return None;
        }

        let previous = self.leave(session_id);

        self.room_sessions.entry(room.to_string()).or_default().insert(session_id);
        self.session_room.insert(session_id, room.to_string());

        previous
    }

    /// Remove a session from whatever room it occupies.
    ///
    /// Returns the vacated room name. Empty room sets are dropped so the map
    /// does not accumulate dead entries.
    pub fn leave(&mut self, session_id: u64) -> Option<String> {
        let room = self.session_room.remove(&session_id)?;

        if let Some(members) = self.room_sessions.get_mut(&room) {
            members.remove(&session_id);
            if members.is_empty() {
                self.room_sessions.remove(&room);
            }
        }

        Some(room)
    }

    /// Room the session currently occupies, if any.
    pub fn room_of(&self, session_id: u64) -> Option<&str> {
        self.session_room.get(&session_id).map(String::as_str)
    }

    /// All session IDs currently in a room.
    pub fn sessions_in_room(&self, room: &str) -> impl Iterator<Item = u64> + '_ {
        self.room_sessions.get(room).into_iter().flat_map(|s| s.iter().copied())
    }

    /// Number of live sessions in a room.
    pub fn room_session_count(&self, room: &str) -> usize {
        self.room_sessions.get(room).map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_release_name() {
        let mut registry = ConnectionRegistry::new();

        assert!(registry.claim_name("Alice", 1));
        assert!(registry.name_taken("Alice"));

        // Second claim by another session fails
        assert!(!registry.claim_name("Alice", 2));

        assert!(registry.release_name("Alice"));
        assert!(!registry.name_taken("Alice"));

        // Released name can be claimed again
        assert!(registry.claim_name("Alice", 2));
    }

    #[test]
    fn release_unheld_name_is_noop() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.release_name("nobody"));
    }

    #[test]
    fn enter_tracks_both_directions() {
        let mut registry = ConnectionRegistry::new();

        assert_eq!(registry.enter(1, "Main"), None);
        assert_eq!(registry.enter(2, "Main"), None);

        assert_eq!(registry.room_of(1), Some("Main"));

        let sessions: Vec<_> = registry.sessions_in_room("Main").collect();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.contains(&1));
        assert!(sessions.contains(&2));
    }

    #[test]
    fn enter_vacates_previous_room() {
        let mut registry = ConnectionRegistry::new();

        registry.enter(1, "Main");
        let vacated = registry.enter(1, "Sports");

        assert_eq!(vacated, Some("Main".to_string()));
        assert_eq!(registry.room_of(1), Some("Sports"));
        assert_eq!(registry.room_session_count("Main"), 0);
        assert_eq!(registry.room_session_count("Sports"), 1);
    }

    #[test]
    fn reenter_same_room_is_noop() {
        let mut registry = ConnectionRegistry::new();

        registry.enter(1, "Main");
        assert_eq!(registry.enter(1, "Main"), None);
        assert_eq!(registry.room_of(1), Some("Main"));
        assert_eq!(registry.room_session_count("Main"), 1);
    }

    #[test]
    fn leave_removes_and_reports_room() {
        let mut registry = ConnectionRegistry::new();

        registry.enter(1, "Main");
        assert_eq!(registry.leave(1), Some("Main".to_string()));
        assert_eq!(registry.room_of(1), None);

        // Second leave is a no-op
        assert_eq!(registry.leave(1), None);
    }

    #[test]
    fn empty_room_set_is_dropped() {
        let mut registry = ConnectionRegistry::new();

        registry.enter(1, "Main");
        registry.leave(1);

        let sessions: Vec<_> = registry.sessions_in_room("Main").collect();
        assert!(sessions.is_empty());
    }
}
