//! Storage abstraction for rooms and message history.
//!
//! Trait-based abstraction over the persistent store. The trait is
//! synchronous (no async) to keep the coordination logic clean; callers run
//! it from the dispatcher, which serializes all mutations.
//!
//! Member-set mutations are the critical surface: `add_member` and
//! `remove_member` are atomic add-if-absent / remove-if-present operations
//! executed inside a single store transaction, never a read-modify-write
//! round trip. Two sessions joining the same room concurrently must both end
//! up recorded.

mod error;
mod memory;
mod redb;

pub use error::StorageError;
pub use memory::MemoryStorage;
use palaver_core::MessageRecord;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// A room as persisted in the ROOMS table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRoom {
    /// Unix timestamp (seconds) when the room was created.
    pub created_at_secs: u64,
    /// Display names of current members. Unordered.
    pub users: Vec<String>,
}

impl StoredRoom {
    /// An empty room created at the given wall-clock time.
    pub fn new(created_at_secs: u64) -> Self {
        Self { created_at_secs, users: Vec::new() }
    }
}

/// Storage abstraction for rooms and message history.
///
/// Must be Clone (shared across the dispatcher and recovery paths), Send +
/// Sync, and synchronous. Implementations share internal state via Arc, so
/// clones access the same underlying store.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Create a room if it does not exist.
    ///
    /// Atomic create-if-absent: returns `true` if the room was created,
    /// `false` if it already existed (metadata untouched). Never errors on
    /// duplicates, never creates two rooms with one name under concurrent
    /// calls.
    fn create_room(&self, name: &str, created_at_secs: u64) -> Result<bool, StorageError>;

    /// Snapshot of all room names. Order is not guaranteed.
    fn list_rooms(&self) -> Result<Vec<String>, StorageError>;

    /// Current member set of a room. `None` if the room does not exist.
    ///
    /// Absence must propagate to callers as room-not-found; it is never
    /// masked.
    fn room_members(&self, name: &str) -> Result<Option<Vec<String>>, StorageError>;

    /// Add `user` to the room's member set if absent.
    ///
    /// Returns `true` if the set changed. Atomic within one transaction.
    ///
    /// # Errors
    ///
    /// `StorageError::RoomMissing` if the room does not exist.
    fn add_member(&self, room: &str, user: &str) -> Result<bool, StorageError>;

    /// Remove `user` from the room's member set if present.
    ///
    /// Returns `true` if the set changed. Atomic within one transaction.
    ///
    /// # Errors
    ///
    /// `StorageError::RoomMissing` if the room does not exist.
    fn remove_member(&self, room: &str, user: &str) -> Result<bool, StorageError>;

    /// Append a message at the given sequence number.
    ///
    /// # Invariants
    ///
    /// - Pre: `seq` must be the next gap-free sequence for the room
    /// - Post: the message is durably persisted at `seq`
    fn store_message(&self, room: &str, seq: u64, message: &MessageRecord)
    -> Result<(), StorageError>;

    /// Latest sequence number for a room. `None` if no messages stored.
    fn latest_seq(&self, room: &str) -> Result<Option<u64>, StorageError>;

    /// Load messages in range `[from, from+limit)`, in sequence order.
    ///
    /// If fewer than `limit` messages exist, returns all available.
    fn load_messages(
        &self,
        room: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;
}
