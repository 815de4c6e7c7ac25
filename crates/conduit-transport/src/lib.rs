//! # conduit-transport
//!
//! Transport abstraction layer for the Conduit resource-binding engine.
//!
//! This crate provides a unified interface over websocket servers:
//!
//! - **axum** - Sockets upgraded by an axum route (the default server mode)
//! - **WebSocket** - A standalone tokio-tungstenite listener
//!
//! ## Transport Abstraction
//!
//! Every transport yields a [`Connection`] whose inbound [`FrameSource`] and
//! outbound [`FrameSink`] can be driven from separate tasks.
//!
//! ```rust,ignore
//! use tenvis_conduit_transport::{Connection, Transport};
//!
//! async fn serve(transport: impl Transport) {
//!     while let Ok(mut conn) = transport.accept().await {
//!         while let Ok(Some(frame)) = conn.source.recv().await {
//!             // Process frame
//!         }
//!     }
//! }
//! ```

pub mod traits;
pub mod upgrade;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{
    close_reason, Connection, FrameSink, FrameSource, Transport, TransportError, CLOSE_NORMAL,
};

#[cfg(feature = "websocket")]
pub use websocket::{upgrade_within, WebSocketConfig, WebSocketTransport};
