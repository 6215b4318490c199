//! TCP transport: listener wrapper and framed event I/O.
//!
//! Events cross the wire as a 4-byte big-endian length prefix followed by a
//! CBOR body ([`palaver_core::protocol`]). The read side accumulates into a
//! `BytesMut` and splits complete frames off the front; a frame larger than
//! the protocol maximum is a violation and the connection is dropped.

use std::net::SocketAddr;

use bytes::BytesMut;
use palaver_core::{
    ClientEvent, ServerEvent,
    protocol::{decode_event, encode_event, split_event},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::server_error::ServerError;

/// TCP listener for client connections.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind to the given address.
    pub async fn bind(addr: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer))
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }
}

/// Read one client event, buffering as needed.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary.
///
/// # Errors
///
/// - [`ServerError::Protocol`] on an oversized or malformed frame, and on
///   EOF mid-frame
/// - [`ServerError::Io`] on socket failure
pub async fn read_client_event<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<ClientEvent>, ServerError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(body) = split_event(buf)? {
            return Ok(Some(decode_event(&body)?));
        }

        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ServerError::Protocol(palaver_core::ProtocolError::Decode(
                "connection closed mid-frame".to_string(),
            )));
        }
    }
}

/// Write one server event with its length prefix.
pub async fn write_server_event<W>(writer: &mut W, event: &ServerEvent) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode_event(event)?;
    writer.write_all(&framed).await?;
    Ok(())
}
