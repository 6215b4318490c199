use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use palaver_core::MessageRecord;

use super::{Storage, StorageError, StoredRoom};

/// In-memory storage implementation for testing and simulation.
///
/// Uses `HashMap` for room lookups and Vec for ordered message storage. All
/// state is wrapped in Arc<Mutex<>> to allow Clone and concurrent access.
/// The single mutex makes every operation atomic, which is exactly the
/// member-set contract the trait demands. Uses `lock().expect()` which
/// panics if the mutex is poisoned - acceptable for test code.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

struct MemoryStorageInner {
    /// Room name → persisted room (member set + metadata)
    rooms: HashMap<String, StoredRoom>,

    /// Messages organized by room, stored in sequence order
    messages: HashMap<String, Vec<MessageRecord>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner {
                rooms: HashMap::new(),
                messages: HashMap::new(),
            })),
        }
    }

    /// Total number of messages across all rooms.
    ///
    /// Useful for debugging and testing.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn total_message_count(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.messages.values().map(std::vec::Vec::len).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)]
impl Storage for MemoryStorage {
    fn create_room(&self, name: &str, created_at_secs: u64) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        if inner.rooms.contains_key(name) {
            return Ok(false);
        }
        inner.rooms.insert(name.to_string(), StoredRoom::new(created_at_secs));
        Ok(true)
    }

    fn list_rooms(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.rooms.keys().cloned().collect())
    }

    fn room_members(&self, name: &str) -> Result<Option<Vec<String>>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.rooms.get(name).map(|room| room.users.clone()))
    }

    fn add_member(&self, room: &str, user: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let stored = inner
            .rooms
            .get_mut(room)
            .ok_or_else(|| StorageError::RoomMissing(room.to_string()))?;

        if stored.users.iter().any(|u| u == user) {
            return Ok(false);
        }
        stored.users.push(user.to_string());
        Ok(true)
    }

    fn remove_member(&self, room: &str, user: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let stored = inner
            .rooms
            .get_mut(room)
            .ok_or_else(|| StorageError::RoomMissing(room.to_string()))?;

        let before = stored.users.len();
        stored.users.retain(|u| u != user);
        Ok(stored.users.len() != before)
    }

    fn store_message(
        &self,
        room: &str,
        seq: u64,
        message: &MessageRecord,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let messages = inner.messages.entry(room.to_string()).or_default();

        let expected = messages.len() as u64;
        if seq != expected {
            return Err(StorageError::Conflict { expected, got: seq });
        }

        messages.push(message.clone());

        debug_assert_eq!(messages.len() as u64 - 1, seq);
        debug_assert_eq!(messages[seq as usize].seq, seq);

        Ok(())
    }

    fn latest_seq(&self, room: &str) -> Result<Option<u64>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner.messages.get(room).and_then(|messages| {
            if messages.is_empty() { None } else { Some(messages.len() as u64 - 1) }
        }))
    }

    fn load_messages(
        &self,
        room: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some(messages) = inner.messages.get(room) else {
            return Ok(Vec::new());
        };

        let start = (from as usize).min(messages.len());
        let end = (start + limit).min(messages.len());

        Ok(messages[start..end].to_vec())
    }
}
