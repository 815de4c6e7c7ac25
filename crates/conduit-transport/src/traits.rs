//! Transport abstraction traits for Conduit.
//!
//! A transport hands the server one [`Connection`] per client: the handshake
//! metadata captured during the upgrade plus an inbound [`FrameSource`] and an
//! outbound [`FrameSink`]. The two halves are independent so reading and
//! writing can run on separate tasks.

use async_trait::async_trait;
use conduit_protocol::{ProtocolError, WireFrame};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tenvis_conduit_core::{ConnectionId, Handshake};
use thiserror::Error;

/// Websocket close code for a normal shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Longest reason a close frame can carry, in bytes.
pub const MAX_CLOSE_REASON: usize = 123;

/// Cut a close reason down to [`MAX_CLOSE_REASON`] bytes on a char boundary.
#[must_use]
pub fn close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Upgrade handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Upgrade handshake did not finish in time.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next data frame, in arrival order.
    ///
    /// Control frames are handled internally. Returns `None` once the peer
    /// has closed the connection.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a data frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Send a close frame with the given code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// An accepted client connection.
pub struct Connection {
    pub id: ConnectionId,
    /// Request metadata captured during the upgrade.
    pub handshake: Handshake,
    pub remote_addr: Option<SocketAddr>,
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
}

impl Connection {
    /// Assemble a connection with a freshly generated id.
    #[must_use]
    pub fn new(
        handshake: Handshake,
        remote_addr: Option<SocketAddr>,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            handshake,
            remote_addr,
            source,
            sink,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("path", &self.handshake.path)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method blocks until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Connection, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}
