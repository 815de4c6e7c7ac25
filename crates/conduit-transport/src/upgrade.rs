//! Adapter for websockets upgraded by axum.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::http::HeaderMap;
use bytes::Bytes;
use conduit_protocol::WireFrame;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use tenvis_conduit_core::Handshake;
use tracing::{debug, trace};

use crate::traits::{close_reason, Connection, FrameSink, FrameSource, TransportError};

/// Build a handshake from the parts of an upgrade request.
#[must_use]
pub fn handshake_from_parts(path: &str, query: Option<&str>, headers: &HeaderMap) -> Handshake {
    let mut handshake = Handshake::new(path);
    if let Some(query) = query {
        handshake = handshake.with_query(query);
    }
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            handshake = handshake.with_header(name.as_str(), value);
        }
    }
    handshake
}

/// Wrap an upgraded socket as a [`Connection`].
#[must_use]
pub fn into_connection(
    socket: WebSocket,
    handshake: Handshake,
    remote_addr: Option<SocketAddr>,
) -> Connection {
    let (sink, stream) = socket.split();
    Connection::new(
        handshake,
        remote_addr,
        Box::new(AxumSource { stream }),
        Box::new(AxumSink { sink }),
    )
}

/// Inbound half of an axum websocket.
pub struct AxumSource {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(WireFrame::Text(text))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(WireFrame::Binary(Bytes::from(data))))
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    trace!("Control frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(code = ?frame.as_ref().map(|f| f.code), "Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => return Ok(None),
            }
        }
    }
}

/// Outbound half of an axum websocket.
pub struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for AxumSink {
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
            code,
            reason: Cow::Owned(close_reason(reason)),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
