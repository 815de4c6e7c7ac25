//! Standalone WebSocket transport.
//!
//! Listens on its own TCP socket and upgrades connections with
//! tokio-tungstenite, capturing the upgrade request's path, query string and
//! headers for authentication.

use async_trait::async_trait;
use bytes::Bytes;
use conduit_protocol::WireFrame;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tenvis_conduit_core::Handshake;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::traits::{close_reason, Connection, FrameSink, FrameSource, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("WebSocket transport listening on {}", config.bind_addr);
        Ok(Self { listener })
    }

    /// Create a new WebSocket transport bound to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig { bind_addr: addr }).await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept a TCP stream without upgrading it.
    ///
    /// Pair with [`upgrade_within`] on a spawned task so one slow client
    /// cannot hold up the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP accept fails.
    pub async fn accept_tcp(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);
        Ok((stream, addr))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, addr) = self.accept_tcp().await?;
        upgrade(stream, Some(addr)).await
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

fn handshake_from_request(request: &Request) -> Handshake {
    let uri = request.uri();
    let mut handshake = Handshake::new(uri.path());
    if let Some(query) = uri.query() {
        handshake = handshake.with_query(query);
    }
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            handshake = handshake.with_header(name.as_str(), value);
        }
    }
    handshake
}

/// Upgrade an accepted TCP stream to a websocket connection.
///
/// # Errors
///
/// Returns an error if the websocket handshake fails.
pub async fn upgrade(
    stream: TcpStream,
    remote_addr: Option<SocketAddr>,
) -> Result<Connection, TransportError> {
    let mut handshake = Handshake::default();
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        handshake = handshake_from_request(request);
        Ok(response)
    };
    let ws_stream = accept_hdr_async(stream, capture).await.map_err(|e| {
        warn!("WebSocket handshake failed: {}", e);
        TransportError::Handshake(e.to_string())
    })?;

    debug!(path = %handshake.path, "WebSocket handshake completed");

    let (sink, stream) = ws_stream.split();
    Ok(Connection::new(
        handshake,
        remote_addr,
        Box::new(WebSocketSource { stream }),
        Box::new(WebSocketSink { sink }),
    ))
}

/// Upgrade a TCP stream, giving up once `timeout` elapses.
///
/// # Errors
///
/// Returns [`TransportError::HandshakeTimeout`] if the client does not
/// finish the handshake in time, or any error from [`upgrade`].
pub async fn upgrade_within(
    stream: TcpStream,
    remote_addr: Option<SocketAddr>,
    timeout: Duration,
) -> Result<Connection, TransportError> {
    match tokio::time::timeout(timeout, upgrade(stream, remote_addr)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(?remote_addr, "WebSocket handshake timed out");
            Err(TransportError::HandshakeTimeout(timeout))
        }
    }
}

/// Inbound half of a tungstenite websocket.
pub struct WebSocketSource {
    stream: SplitStream<WebSocketStream<TcpStream>>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(WireFrame::Text(text))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(WireFrame::Binary(Bytes::from(data))))
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    trace!("Control frame");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

/// Outbound half of a tungstenite websocket.
pub struct WebSocketSink {
    sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(close_reason(reason)),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
