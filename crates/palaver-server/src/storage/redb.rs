//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety. Rooms
//! and message history survive server restarts. Redb serializes writers, so
//! the member-set read-mutate-write below happens inside one transaction and
//! is atomic with respect to every other member mutation.

use std::{path::Path, sync::Arc};

use palaver_core::MessageRecord;
use redb::{Database, ReadableTable, TableDefinition};

use super::{Storage, StorageError, StoredRoom};

/// Table: rooms
/// Key: room name
/// Value: CBOR-encoded StoredRoom (member set + metadata)
const ROOMS: TableDefinition<&str, &[u8]> = TableDefinition::new("rooms");

/// Table: messages
/// Key: (room name, sequence number)
/// Value: CBOR-encoded MessageRecord
///
/// The composite key orders by room first, then sequence, so a range scan
/// over one room yields messages in write order.
const MESSAGES: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("messages");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates the ROOMS and MESSAGES tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or
    /// created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Find the latest sequence number for a room within an open table.
    fn compute_latest_seq<T: ReadableTable<(&'static str, u64), &'static [u8]>>(
        table: &T,
        room: &str,
    ) -> Result<Option<u64>, StorageError> {
        let mut range = table
            .range((room, 0u64)..=(room, u64::MAX))
            .map_err(|e| StorageError::Io(e.to_string()))?;

        match range.next_back() {
            Some(result) => {
                let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                let (_, seq) = key.value();
                Ok(Some(seq))
            },
            None => Ok(None),
        }
    }

    fn decode_room(bytes: &[u8]) -> Result<StoredRoom, StorageError> {
        ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn encode_room(room: &StoredRoom) -> Result<Vec<u8>, StorageError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(room, &mut bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Apply `mutate` to a room's member set inside one write transaction.
    ///
    /// Returns whether the set changed. The whole load-mutate-store runs
    /// under Redb's single-writer lock, so concurrent joins cannot lose
    /// updates.
    fn mutate_members(
        &self,
        room: &str,
        mutate: impl FnOnce(&mut Vec<String>) -> bool,
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let changed = {
            let mut table = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;

            let mut stored = {
                let guard = table.get(room).map_err(|e| StorageError::Io(e.to_string()))?;
                match guard {
                    Some(value) => Self::decode_room(value.value())?,
                    None => return Err(StorageError::RoomMissing(room.to_string())),
                }
            };

            let changed = mutate(&mut stored.users);
            if changed {
                let bytes = Self::encode_room(&stored)?;
                table
                    .insert(room, bytes.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }
            changed
        };

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(changed)
    }
}

impl Storage for RedbStorage {
    fn create_room(&self, name: &str, created_at_secs: u64) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let created = {
            let mut table = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;

            let exists = table
                .get(name)
                .map_err(|e| StorageError::Io(e.to_string()))?
                .is_some();

            if exists {
                false // Already exists, don't overwrite
            } else {
                let bytes = Self::encode_room(&StoredRoom::new(created_at_secs))?;
                table
                    .insert(name, bytes.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
                true
            }
        };

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(created)
    }

    fn list_rooms(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut rooms = Vec::new();
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            rooms.push(key.value().to_string());
        }

        Ok(rooms)
    }

    fn room_members(&self, name: &str) -> Result<Option<Vec<String>>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(ROOMS).map_err(|e| StorageError::Io(e.to_string()))?;

        match table.get(name).map_err(|e| StorageError::Io(e.to_string()))? {
            Some(value) => Ok(Some(Self::decode_room(value.value())?.users)),
            None => Ok(None),
        }
    }

    fn add_member(&self, room: &str, user: &str) -> Result<bool, StorageError> {
        self.mutate_members(room, |users| {
            if users.iter().any(|u| u == user) {
                false
            } else {
                users.push(user.to_string());
                true
            }
        })
    }

    fn remove_member(&self, room: &str, user: &str) -> Result<bool, StorageError> {
        self.mutate_members(room, |users| {
            let before = users.len();
            users.retain(|u| u != user);
            users.len() != before
        })
    }

    fn store_message(
        &self,
        room: &str,
        seq: u64,
        message: &MessageRecord,
    ) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

            let expected = Self::compute_latest_seq(&table, room)?.map_or(0, |latest| latest + 1);
            if seq != expected {
                return Err(StorageError::Conflict { expected, got: seq });
            }

            let mut bytes = Vec::new();
            ciborium::into_writer(message, &mut bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            table
                .insert((room, seq), bytes.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn latest_seq(&self, room: &str) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        Self::compute_latest_seq(&table, room)
    }

    fn load_messages(
        &self,
        room: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        let range = table
            .range((room, from)..=(room, u64::MAX))
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let mut messages = Vec::with_capacity(limit.min(64));
        for result in range {
            if messages.len() >= limit {
                break;
            }

            let (_, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let message: MessageRecord = ciborium::from_reader(value.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            messages.push(message);
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn record(room: &str, seq: u64) -> MessageRecord {
        MessageRecord {
            room: room.to_string(),
            author: "Alice".to_string(),
            body: format!("msg-{seq}"),
            time: "12:00".to_string(),
            seq,
        }
    }

    #[test]
    fn create_room_idempotent() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert!(storage.create_room("Main", 100).unwrap());
        assert!(!storage.create_room("Main", 200).unwrap());

        assert_eq!(storage.list_rooms().unwrap(), vec!["Main".to_string()]);
    }

    #[test]
    fn member_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.create_room("Main", 0).unwrap();

        assert!(storage.add_member("Main", "Alice").unwrap());
        assert!(storage.add_member("Main", "Bob").unwrap());
        assert!(!storage.add_member("Main", "Alice").unwrap());

        let mut members = storage.room_members("Main").unwrap().unwrap();
        members.sort();
        assert_eq!(members, vec!["Alice".to_string(), "Bob".to_string()]);

        assert!(storage.remove_member("Main", "Alice").unwrap());
        assert!(!storage.remove_member("Main", "Alice").unwrap());
        assert_eq!(storage.room_members("Main").unwrap().unwrap(), vec!["Bob".to_string()]);
    }

    #[test]
    fn member_ops_require_room() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert!(matches!(
            storage.add_member("nowhere", "Alice"),
            Err(StorageError::RoomMissing(_))
        ));
    }

    #[test]
    fn missing_room_members_is_none() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert!(storage.room_members("nowhere").unwrap().is_none());
    }

    #[test]
    fn store_messages_sequential() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for i in 0..3 {
            storage.store_message("Main", i, &record("Main", i)).unwrap();
        }

        assert_eq!(storage.latest_seq("Main").unwrap(), Some(2));
    }

    #[test]
    fn store_message_conflict() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.store_message("Main", 0, &record("Main", 0)).unwrap();

        let result = storage.store_message("Main", 2, &record("Main", 2));
        match result {
            Err(StorageError::Conflict { expected: 1, got: 2 }) => {},
            other => panic!("Expected Conflict error, got: {:?}", other),
        }
    }

    #[test]
    fn latest_seq_empty_room() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert_eq!(storage.latest_seq("Main").unwrap(), None);
    }

    #[test]
    fn load_messages_pagination() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for i in 0..20 {
            storage.store_message("Main", i, &record("Main", i)).unwrap();
        }

        let batch1 = storage.load_messages("Main", 0, 10).unwrap();
        assert_eq!(batch1.len(), 10);
        assert_eq!(batch1[0].seq, 0);
        assert_eq!(batch1[9].seq, 9);

        let batch2 = storage.load_messages("Main", 10, 10).unwrap();
        assert_eq!(batch2.len(), 10);
        assert_eq!(batch2[9].seq, 19);

        let batch3 = storage.load_messages("Main", 20, 10).unwrap();
        assert!(batch3.is_empty());
    }

    #[test]
    fn rooms_do_not_share_logs() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for i in 0..5 {
            storage.store_message("Main", i, &record("Main", i)).unwrap();
        }
        for i in 0..3 {
            storage.store_message("Sports", i, &record("Sports", i)).unwrap();
        }

        // Range scans stay within one room's key space
        let main = storage.load_messages("Main", 0, 100).unwrap();
        assert_eq!(main.len(), 5);
        assert!(main.iter().all(|m| m.room == "Main"));

        assert_eq!(storage.latest_seq("Sports").unwrap(), Some(2));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.create_room("Main", 42).unwrap();
            storage.add_member("Main", "Alice").unwrap();
            storage.store_message("Main", 0, &record("Main", 0)).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.list_rooms().unwrap(), vec!["Main".to_string()]);
        assert_eq!(storage.room_members("Main").unwrap().unwrap(), vec!["Alice".to_string()]);
        assert_eq!(storage.latest_seq("Main").unwrap(), Some(0));
    }
}
