//! Presence events: user lists and join/leave notices.
//!
//! Centralizes the wording and shape of everything the server says about
//! who is where. The dispatcher decides who receives these; this module
//! only builds them.

use palaver_core::ServerEvent;

/// Builds presence-related server events.
#[derive(Debug, Default, Clone, Copy)]
pub struct PresencePublisher;

impl PresencePublisher {
    /// Create a presence publisher.
    pub fn new() -> Self {
        Self
    }

    /// Member roster of a room.
    pub fn user_list(&self, names: Vec<String>) -> ServerEvent {
        ServerEvent::UserList { names }
    }

    /// Catalog of all rooms.
    pub fn room_list(&self, names: Vec<String>) -> ServerEvent {
        ServerEvent::RoomList { names }
    }

    /// Notice shown in a room when a user joins.
    ///
    /// Delivered through the chat channel like a regular message, but not
    /// persisted to the room's log.
    pub fn join_notice(&self, name: &str) -> ServerEvent {
        ServerEvent::ChatMessage { text: format!("{name} has joined the room.") }
    }

    /// Notice shown in a room when a user leaves or disconnects.
    pub fn leave_notice(&self, name: &str) -> ServerEvent {
        ServerEvent::ChatMessage { text: format!("{name} has left the room.") }
    }
}
