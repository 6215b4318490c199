//! Core coordination logic for the palaver chat server.
//!
//! This crate holds the pure, I/O-free pieces: the session state machine,
//! the wire protocol (events + codec), and the environment abstraction that
//! decouples the logic from system time and randomness. The production
//! server crate wraps these with real transport and storage.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod error;
pub mod protocol;
pub mod session;

pub use error::SessionError;
pub use protocol::{ClientEvent, MessageRecord, ProtocolError, ServerEvent};
pub use session::{Session, SessionConfig, SessionState};
