//! Error types for the palaver core.
//!
//! Strongly-typed errors for the session state machine. Validation failures
//! (bad names) are kept distinct from lifecycle violations (operations in
//! the wrong state) so the server can answer the client appropriately: the
//! former get an error event and a re-prompt, the latter are rejected
//! outright.

use thiserror::Error;

use crate::session::SessionState;

/// Errors that can occur during session state machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Proposed display name failed validation.
    #[error("invalid name: {reason}")]
    InvalidName {
        /// Why the name was rejected
        reason: String,
    },

    /// Operation attempted from a state that does not permit it.
    #[error("invalid state transition: cannot {operation} from {state:?}")]
    InvalidState {
        /// Current state when the error occurred
        state: SessionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Session is disconnected; all operations are rejected.
    #[error("session is disconnected")]
    Disconnected,
}

impl SessionError {
    /// Returns true if the client should be re-prompted rather than dropped.
    ///
    /// Name validation failures are recoverable (the client simply picks
    /// another name); state violations indicate a confused or misbehaving
    /// client.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidName { .. })
    }
}
