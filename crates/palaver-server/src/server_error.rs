//! Top-level server error type.

use palaver_core::{ProtocolError, SessionError};
use thiserror::Error;

use crate::{rooms::RoomError, storage::StorageError};

/// Errors surfaced by the server dispatcher and runtime.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Event referenced a session the dispatcher does not know.
    #[error("session not found: {0}")]
    SessionNotFound(u64),

    /// Session state machine rejected an operation.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Room operation failed.
    #[error("room error: {0}")]
    Room(#[from] RoomError),

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
