//! Wire protocol: events exchanged between client and server.
//!
//! Events are CBOR-encoded and framed with a 4-byte big-endian length
//! prefix. CBOR keeps the wire self-describing (useful when adding fields)
//! while staying compact; the length prefix lets the transport read exactly
//! one event without scanning for delimiters.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded size of a single event.
///
/// Anything larger is treated as a protocol violation and the connection is
/// dropped. Generous for chat text, small enough to bound per-connection
/// buffering.
pub const MAX_EVENT_SIZE: usize = 64 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors from event encoding and decoding.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Event exceeded [`MAX_EVENT_SIZE`].
    #[error("event too large: {size} bytes (max {MAX_EVENT_SIZE})")]
    EventTooLarge {
        /// Claimed or actual encoded size
        size: usize,
    },

    /// CBOR serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR deserialization failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// A persisted chat message as replayed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Room the message was sent to
    pub room: String,
    /// Author's display name
    pub author: String,
    /// Message body as typed by the author
    pub body: String,
    /// Formatted wall-clock time (`HH:MM`)
    pub time: String,
    /// Per-room sequence number; strictly increasing, gap-free
    pub seq: u64,
}

impl MessageRecord {
    /// Render the message the way it is broadcast to clients.
    pub fn formatted(&self) -> String {
        format!("{} - {}: {}", self.time, self.author, self.body)
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Respond to the name prompt with a proposed display name.
    ChooseName {
        /// Proposed display name
        name: String,
    },

    /// Join an existing room by name.
    JoinRoom {
        /// Target room name
        room: String,
    },

    /// Create a room. Idempotent: creating an existing room is a no-op.
    CreateRoom {
        /// New room name
        room: String,
    },

    /// Send a chat message to the session's current room.
    ChatMessage {
        /// Message body
        text: String,
    },
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Prompt the client to choose a display name.
    ChooseName,

    /// Snapshot of all room names.
    RoomList {
        /// Room names, unordered
        names: Vec<String>,
    },

    /// The session's current room changed.
    CurrentRoom {
        /// Room the session is now in
        name: String,
    },

    /// Occupant list for the session's room changed.
    UserList {
        /// Display names of current occupants
        names: Vec<String>,
    },

    /// A chat message or room notice, pre-rendered for display.
    ChatMessage {
        /// `HH:MM - name: text` for chat, plain text for notices
        text: String,
    },

    /// Message history replay for a room.
    ChatHistory {
        /// Room the history belongs to
        room: String,
        /// Messages in sequence order
        messages: Vec<MessageRecord>,
    },

    /// An operation failed; shown to the originating client only.
    Error {
        /// Human-readable description
        message: String,
    },
}

/// Encode an event with its length prefix.
pub fn encode_event<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
    let mut body = Vec::new();
    ciborium::into_writer(event, &mut body).map_err(|e| ProtocolError::Encode(e.to_string()))?;

    if body.len() > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge { size: body.len() });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode the length prefix. Errors if it exceeds [`MAX_EVENT_SIZE`].
pub fn decode_length(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge { size: len });
    }
    Ok(len)
}

/// Decode an event body (without the length prefix).
pub fn decode_event<T: for<'de> Deserialize<'de>>(mut body: &[u8]) -> Result<T, ProtocolError> {
    ciborium::from_reader(&mut body).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Split one framed event off the front of `buf`, if complete.
///
/// Returns `Ok(None)` when more bytes are needed. On success the consumed
/// bytes are advanced past.
pub fn split_event(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
    let len = decode_length(prefix)?;

    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(buf.split_to(len).freeze()))
}
