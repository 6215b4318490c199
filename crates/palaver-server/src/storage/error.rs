//! Storage error types.

use thiserror::Error;

/// Errors from storage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Underlying I/O or database failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Message written out of sequence order.
    ///
    /// The store only accepts the next gap-free sequence number; anything
    /// else means the caller's cached counter drifted from the log.
    #[error("sequence conflict: expected {expected}, got {got}")]
    Conflict {
        /// Sequence number the log expects next
        expected: u64,
        /// Sequence number the caller supplied
        got: u64,
    },

    /// Member operation targeted a room that is not in the store.
    #[error("room not in store: {0}")]
    RoomMissing(String),
}
