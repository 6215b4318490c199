//! Ordered, durable message log per room.
//!
//! Assigns each message a contiguous per-room sequence number and persists
//! it before anyone sees it. The next sequence for each room is cached and
//! lazily initialized from storage, so restarts resume numbering where the
//! log left off.
//!
//! The store rejects out-of-order writes with a conflict. On conflict the
//! cache entry is dropped, so the next append re-reads the authoritative
//! sequence from storage instead of staying wedged.

use std::collections::HashMap;

use palaver_core::MessageRecord;

use crate::storage::{Storage, StorageError};

/// How many trailing messages a joining session receives.
pub const HISTORY_LIMIT: usize = 50;

/// Per-room message log with gap-free sequencing.
#[derive(Debug)]
pub struct MessageStore<S: Storage> {
    storage: S,
    /// Room name → next sequence to assign. Lazily seeded from storage
    next_seq: HashMap<String, u64>,
}

impl<S: Storage> MessageStore<S> {
    /// Create a message store over the given storage backend.
    pub fn new(storage: S) -> Self {
        Self { storage, next_seq: HashMap::new() }
    }

    /// Append a message to a room's log.
    ///
    /// Assigns the next sequence number, persists the record, and returns
    /// it only once the write is durable.
    ///
    /// # Errors
    ///
    /// Propagates storage failures. On [`StorageError::Conflict`] the
    /// cached counter for the room is discarded so the next call recovers
    /// from the stored log.
    pub fn append(
        &mut self,
        room: &str,
        author: &str,
        body: &str,
        time: &str,
    ) -> Result<MessageRecord, StorageError> {
        let seq = self.next_seq_for(room)?;

        let record = MessageRecord {
            room: room.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            time: time.to_string(),
            seq,
        };

        if let Err(e) = self.storage.store_message(room, seq, &record) {
            if matches!(e, StorageError::Conflict { .. }) {
                self.next_seq.remove(room);
            }
            return Err(e);
        }

        self.next_seq.insert(room.to_string(), seq + 1);

        Ok(record)
    }

    /// Most recent messages of a room, in sequence order, at most
    /// [`HISTORY_LIMIT`] of them.
    pub fn recent(&self, room: &str) -> Result<Vec<MessageRecord>, StorageError> {
        let from = match self.storage.latest_seq(room)? {
            Some(latest) => (latest + 1).saturating_sub(HISTORY_LIMIT as u64),
            None => return Ok(Vec::new()),
        };
        self.storage.load_messages(room, from, HISTORY_LIMIT)
    }

    /// Messages in range `[from, from+limit)`, in sequence order.
    pub fn history(
        &self,
        room: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.storage.load_messages(room, from, limit)
    }

    /// Next sequence for a room, seeding the cache from storage on first
    /// touch.
    fn next_seq_for(&mut self, room: &str) -> Result<u64, StorageError> {
        if let Some(seq) = self.next_seq.get(room) {
            return Ok(*seq);
        }

        let next = self.storage.latest_seq(room)?.map_or(0, |latest| latest + 1);
        self.next_seq.insert(room.to_string(), next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn append_assigns_contiguous_sequences() {
        let storage = MemoryStorage::new();
        let mut store = MessageStore::new(storage);

        for i in 0..5 {
            let record = store.append("Main", "Alice", &format!("msg-{i}"), "12:00").unwrap();
            assert_eq!(record.seq, i);
        }
    }

    #[test]
    fn rooms_sequence_independently() {
        let storage = MemoryStorage::new();
        let mut store = MessageStore::new(storage);

        assert_eq!(store.append("Main", "Alice", "a", "12:00").unwrap().seq, 0);
        assert_eq!(store.append("Sports", "Bob", "b", "12:00").unwrap().seq, 0);
        assert_eq!(store.append("Main", "Alice", "c", "12:01").unwrap().seq, 1);
    }

    #[test]
    fn sequencing_resumes_from_stored_log() {
        let storage = MemoryStorage::new();

        {
            let mut store = MessageStore::new(storage.clone());
            store.append("Main", "Alice", "before", "12:00").unwrap();
            store.append("Main", "Alice", "restart", "12:01").unwrap();
        }

        // Fresh store over the same backend picks up at seq 2
        let mut store = MessageStore::new(storage);
        let record = store.append("Main", "Bob", "after", "12:02").unwrap();
        assert_eq!(record.seq, 2);
    }

    #[test]
    fn conflict_drops_cache_and_recovers() {
        let storage = MemoryStorage::new();
        let mut store = MessageStore::new(storage.clone());

        store.append("Main", "Alice", "first", "12:00").unwrap();

        // Another writer advances the log behind the store's back
        let intruder = MessageRecord {
            room: "Main".to_string(),
            author: "Bob".to_string(),
            body: "sneaky".to_string(),
            time: "12:00".to_string(),
            seq: 1,
        };
        storage.store_message("Main", 1, &intruder).unwrap();

        // Cached counter says 1, which now collides
        let result = store.append("Main", "Alice", "second", "12:01");
        assert!(matches!(result, Err(StorageError::Conflict { .. })));

        // Next append re-seeds from storage and succeeds at seq 2
        let record = store.append("Main", "Alice", "second", "12:01").unwrap();
        assert_eq!(record.seq, 2);
    }

    #[test]
    fn recent_returns_tail_of_log() {
        let storage = MemoryStorage::new();
        let mut store = MessageStore::new(storage);

        for i in 0..(HISTORY_LIMIT + 10) {
            store.append("Main", "Alice", &format!("msg-{i}"), "12:00").unwrap();
        }

        let recent = store.recent("Main").unwrap();
        assert_eq!(recent.len(), HISTORY_LIMIT);
        assert_eq!(recent[0].seq, 10);
        assert_eq!(recent[HISTORY_LIMIT - 1].seq, (HISTORY_LIMIT + 10 - 1) as u64);
    }

    #[test]
    fn recent_of_empty_room_is_empty() {
        let storage = MemoryStorage::new();
        let store = MessageStore::new(storage);

        assert!(store.recent("Main").unwrap().is_empty());
    }

    #[test]
    fn history_pagination() {
        let storage = MemoryStorage::new();
        let mut store = MessageStore::new(storage);

        for i in 0..10 {
            store.append("Main", "Alice", &format!("msg-{i}"), "12:00").unwrap();
        }

        let page = store.history("Main", 4, 3).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].seq, 4);
        assert_eq!(page[2].seq, 6);
    }
}
