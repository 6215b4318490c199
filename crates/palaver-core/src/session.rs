//! Session state machine.
//!
//! Tracks one client connection's identity and room association. Pure state
//! machine: no I/O, time passed in as parameters, so the same code runs
//! under the production clock and under virtual time in tests.
//!
//! # State machine
//!
//! ```text
//! ┌─────┐ ChooseName ┌───────┐  JoinRoom   ┌────────┐──┐ JoinRoom
//! │ New │───────────>│ Named │────────────>│ InRoom │<─┘ (switch)
//! └─────┘            └───────┘             └────────┘
//!    │                   │                      │
//!    │ timeout/close     │ close                │ close
//!    ↓                   ↓                      ↓
//!              ┌──────────────┐
//!              │ Disconnected │  (terminal)
//!              └──────────────┘
//! ```
//!
//! Only `Named` or `InRoom` sessions may join/create rooms or chat;
//! `Disconnected` sessions reject everything.

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

use crate::error::SessionError;

/// Time allowed for a fresh session to choose a display name.
pub const DEFAULT_NAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum display name length in characters.
pub const MAX_NAME_LEN: usize = 32;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no display name chosen yet
    New,
    /// Named but not yet placed in a room
    Named,
    /// Named and associated with exactly one room
    InRoom,
    /// Connection gone (graceful or error); terminal
    Disconnected,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a session may remain unnamed before it is closed
    pub name_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { name_timeout: DEFAULT_NAME_TIMEOUT }
    }
}

/// One live client connection's identity and room association.
///
/// Owned by the gateway and handed to every handler; never duplicated into
/// shared state. Generic over `I` (Instant type) to support virtual time in
/// tests.
#[derive(Debug, Clone)]
pub struct Session<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Identifier assigned by the gateway
    id: u64,
    /// Current lifecycle state
    state: SessionState,
    /// Display name; `None` until assigned
    name: Option<String>,
    /// Current room; `None` unless in `InRoom`
    room: Option<String>,
    /// Configuration
    config: SessionConfig,
    /// When the connection was accepted (for the naming deadline)
    connected_at: I,
}

impl<I> Session<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new session in [`SessionState::New`].
    pub fn new(id: u64, now: I, config: SessionConfig) -> Self {
        Self { id, state: SessionState::New, name: None, room: None, config, connected_at: now }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Display name. `None` until assigned.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Current room. `None` unless the session is in a room.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Assign the display name, transitioning `New → Named`.
    ///
    /// The proposed name is trimmed; an empty or oversized result is
    /// rejected with [`SessionError::InvalidName`] and the session stays in
    /// `New` so the client can be re-prompted. There is no guest fallback.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if the trimmed name is empty or too long
    /// - `InvalidState` if the session already has a name
    /// - `Disconnected` if the session is closed
    pub fn assign_name(&mut self, proposed: &str) -> Result<String, SessionError> {
        match self.state {
            SessionState::Disconnected => return Err(SessionError::Disconnected),
            SessionState::New => {},
            state => {
                return Err(SessionError::InvalidState { state, operation: "assign_name" });
            },
        }

        let name = proposed.trim();
        if name.is_empty() {
            return Err(SessionError::InvalidName { reason: "name must not be empty".to_string() });
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(SessionError::InvalidName {
                reason: format!("name exceeds {MAX_NAME_LEN} characters"),
            });
        }

        self.name = Some(name.to_string());
        self.state = SessionState::Named;

        debug_assert!(self.room.is_none());

        Ok(name.to_string())
    }

    /// Move the session into `room`, returning the room it vacated (if any).
    ///
    /// Re-entrant: an `InRoom` session switching rooms stays `InRoom`. The
    /// caller is responsible for the persisted member-set updates; this only
    /// records the association.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the session has no name yet
    /// - `Disconnected` if the session is closed
    pub fn enter_room(&mut self, room: &str) -> Result<Option<String>, SessionError> {
        match self.state {
            SessionState::Disconnected => return Err(SessionError::Disconnected),
            SessionState::New => {
                return Err(SessionError::InvalidState {
                    state: SessionState::New,
                    operation: "enter_room",
                });
            },
            SessionState::Named | SessionState::InRoom => {},
        }

        let vacated = self.room.replace(room.to_string());
        self.state = SessionState::InRoom;
        Ok(vacated)
    }

    /// Clear the room association, returning the vacated room.
    ///
    /// Idempotent: a session not in a room returns `None` and nothing
    /// changes.
    pub fn leave_room(&mut self) -> Option<String> {
        let vacated = self.room.take();
        if self.state == SessionState::InRoom {
            self.state = SessionState::Named;
        }
        vacated
    }

    /// Mark the session disconnected, returning the room it vacated.
    ///
    /// Terminal and idempotent: a second call returns `None`.
    pub fn disconnect(&mut self) -> Option<String> {
        let vacated = self.room.take();
        self.state = SessionState::Disconnected;
        vacated
    }

    /// The session's current room, required for chat.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the session is not in a room (unnamed sessions
    ///   land here too: chat from `New` is a validation failure, and no
    ///   message may be persisted)
    /// - `Disconnected` if the session is closed
    pub fn chat_room(&self) -> Result<&str, SessionError> {
        match self.state {
            SessionState::Disconnected => Err(SessionError::Disconnected),
            SessionState::InRoom => {
                self.room.as_deref().ok_or(SessionError::InvalidState {
                    state: SessionState::InRoom,
                    operation: "chat",
                })
            },
            state => Err(SessionError::InvalidState { state, operation: "chat" }),
        }
    }

    /// Elapsed time past the naming deadline, if exceeded.
    ///
    /// Only `New` sessions have a deadline; returns `None` otherwise.
    #[must_use]
    pub fn check_name_timeout(&self, now: I) -> Option<Duration> {
        if self.state != SessionState::New {
            return None;
        }

        let elapsed = now - self.connected_at;
        if elapsed > self.config.name_timeout { Some(elapsed) } else { None }
    }
}
