//! Room registry: validated room creation and durable membership.
//!
//! Thin layer over [`Storage`] that owns room-name validation and the
//! default room. All room existence checks go through here so absence
//! surfaces as [`RoomError::RoomNotFound`] instead of being silently
//! treated as an empty room.

use thiserror::Error;

use crate::storage::{Storage, StorageError};

/// Room every session lands in after choosing a name.
pub const DEFAULT_ROOM: &str = "Main";

/// Longest accepted room name, in characters.
pub const MAX_ROOM_NAME_LEN: usize = 32;

/// Errors from room operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Proposed room name failed validation.
    #[error("invalid room name: {reason}")]
    InvalidName {
        /// Why the name was rejected
        reason: String,
    },

    /// Operation targeted a room that does not exist.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Registry of named persistent rooms.
///
/// Rooms are never deleted. Membership recorded here is the durable record;
/// the live socket index is [`crate::registry::ConnectionRegistry`]'s job.
#[derive(Debug, Clone)]
pub struct RoomRegistry<S: Storage> {
    storage: S,
}

impl<S: Storage> RoomRegistry<S> {
    /// Create a registry over the given storage backend.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Ensure the default room exists.
    ///
    /// Called once at startup. Idempotent across restarts.
    pub fn ensure_default(&self, created_at_secs: u64) -> Result<(), RoomError> {
        self.storage.create_room(DEFAULT_ROOM, created_at_secs)?;
        Ok(())
    }

    /// Create a room with a validated name.
    ///
    /// Leading and trailing whitespace is trimmed before validation.
    /// Returns the canonical name and whether the room was newly created.
    /// Creating an existing room is not an error, it reports `false`.
    pub fn create(&self, proposed: &str, created_at_secs: u64) -> Result<(String, bool), RoomError> {
        let name = Self::validate_name(proposed)?;
        let created = self.storage.create_room(&name, created_at_secs)?;
        Ok((name, created))
    }

    /// Snapshot of all room names, sorted for stable presentation.
    pub fn room_names(&self) -> Result<Vec<String>, RoomError> {
        let mut names = self.storage.list_rooms()?;
        names.sort();
        Ok(names)
    }

    /// Whether a room exists.
    pub fn exists(&self, name: &str) -> Result<bool, RoomError> {
        Ok(self.storage.room_members(name)?.is_some())
    }

    /// Durable member set of a room, sorted.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomNotFound`] if the room does not exist.
    pub fn members(&self, name: &str) -> Result<Vec<String>, RoomError> {
        let mut members = self
            .storage
            .room_members(name)?
            .ok_or_else(|| RoomError::RoomNotFound(name.to_string()))?;
        members.sort();
        Ok(members)
    }

    /// Record a user in a room's durable member set.
    ///
    /// Returns `true` if the set changed.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomNotFound`] if the room does not exist.
    pub fn add_member(&self, room: &str, user: &str) -> Result<bool, RoomError> {
        self.storage.add_member(room, user).map_err(Self::map_missing(room))
    }

    /// Remove a user from a room's durable member set.
    ///
    /// Returns `true` if the set changed. Removing an absent user is a
    /// no-op, never an error.
    pub fn remove_member(&self, room: &str, user: &str) -> Result<bool, RoomError> {
        self.storage.remove_member(room, user).map_err(Self::map_missing(room))
    }

    fn map_missing(room: &str) -> impl FnOnce(StorageError) -> RoomError + '_ {
        move |e| match e {
            StorageError::RoomMissing(_) => RoomError::RoomNotFound(room.to_string()),
            other => RoomError::Storage(other),
        }
    }

    /// Validate and canonicalize a proposed room name.
    fn validate_name(proposed: &str) -> Result<String, RoomError> {
        let name = proposed.trim();

        if name.is_empty() {
            return Err(RoomError::InvalidName { reason: "name is empty".to_string() });
        }
        if name.chars().count() > MAX_ROOM_NAME_LEN {
            return Err(RoomError::InvalidName {
                reason: format!("name exceeds {MAX_ROOM_NAME_LEN} characters"),
            });
        }

        Ok(name.to_string())
    }
}
