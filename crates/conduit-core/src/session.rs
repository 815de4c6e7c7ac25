//! Per-connection session state.
//!
//! A session is created when a connection is accepted and dropped when it
//! disconnects. It owns the connection's identity and is passed by reference
//! into every dispatch.

use crate::auth::Identity;
use conduit_protocol::{Envelope, WireFormat};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-ordered connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::now_v7().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The reply channel has no receiver; the connection is gone.
#[derive(Debug, Error)]
#[error("Reply channel closed for connection {0}")]
pub struct ReplyClosed(pub ConnectionId);

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Envelope was queued for the connection.
    Delivered,
    /// Connection's outbound queue is full. The envelope was dropped.
    Full,
    /// Connection has gone away.
    Closed,
}

/// Handle used to push envelopes to one connection's writer.
#[derive(Debug, Clone)]
pub struct ReplyChannel {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Envelope>,
}

impl ReplyChannel {
    /// Wrap an existing sender.
    #[must_use]
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<Envelope>) -> Self {
        Self { connection_id, tx }
    }

    /// Create a bounded reply channel and its receiving half.
    #[must_use]
    pub fn bounded(
        connection_id: ConnectionId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(connection_id, tx), rx)
    }

    /// The connection this channel delivers to.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Queue an envelope, waiting for room in the queue.
    ///
    /// Used for a connection's own responses, which must not be dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection's writer is gone.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ReplyClosed> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| ReplyClosed(self.connection_id.clone()))
    }

    /// Queue an envelope without waiting.
    pub fn try_deliver(&self, envelope: Envelope) -> Delivery {
        match self.tx.try_send(envelope) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Check whether the receiving side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// State tracked for one connection.
#[derive(Debug)]
pub struct Session {
    connection_id: ConnectionId,
    identity: Identity,
    format: WireFormat,
    connected_at: Instant,
    frames: u64,
}

impl Session {
    /// Create a new anonymous session.
    #[must_use]
    pub fn new(connection_id: ConnectionId, format: WireFormat) -> Self {
        Self {
            connection_id,
            identity: Identity::Anonymous,
            format,
            connected_at: Instant::now(),
            frames: 0,
        }
    }

    /// The connection ID.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// The identity attached to this session.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Attach an identity.
    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = identity;
    }

    /// Outbound wire format negotiated at connect.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Count one processed frame.
    pub fn touch(&mut self) {
        self.frames += 1;
    }

    /// Number of frames processed.
    #[must_use]
    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Time since the connection was accepted.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
