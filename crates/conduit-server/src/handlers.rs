//! Connection handlers for Conduit server.
//!
//! This module owns the connection lifecycle: accepting sockets from either
//! transport, authenticating, pumping frames through a [`Multiplexer`] and
//! writing queued envelopes back out.

use crate::bindings;
use crate::config::{Config, TransportMode};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use conduit_protocol::{Envelope, EnvelopeCodec, CLOSE_POLICY_VIOLATION};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tenvis_conduit_core::{
    Authenticator, BindingRegistry, ConnectionId, Dispatcher, GroupRegistry, Multiplexer,
    RegistryConfig, ReplyChannel,
};
use tenvis_conduit_transport::{
    upgrade, upgrade_within, Connection, FrameSink, Transport, WebSocketTransport, CLOSE_NORMAL,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Close code sent when the server is at its connection limit.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Shared server state.
pub struct AppState {
    /// Stream to binding table.
    pub bindings: Arc<BindingRegistry>,
    /// Request dispatcher, shared by every connection.
    pub dispatcher: Arc<Dispatcher>,
    /// Notification groups.
    pub groups: Arc<GroupRegistry>,
    /// Handshake authenticator.
    pub authenticator: Arc<dyn Authenticator>,
    /// Server configuration.
    pub config: Config,
    active: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured bindings are invalid.
    pub fn new(config: Config) -> Result<Self> {
        let registry_config = RegistryConfig {
            max_subscriptions_per_connection: config.limits.max_subscriptions_per_connection,
            auto_delete_empty_groups: true,
        };
        let groups = Arc::new(GroupRegistry::with_config(registry_config));
        let bindings = Arc::new(bindings::build_registry(&config)?);
        let authenticator = Arc::new(bindings::build_authenticator(&config.auth));

        if bindings.is_empty() {
            warn!("No bindings configured, every request will be rejected");
        }

        Ok(Self {
            bindings,
            dispatcher: Arc::new(Dispatcher::new(groups.clone())),
            groups,
            authenticator,
            config,
            active: AtomicUsize::new(0),
        })
    }

    /// Number of connections currently being driven.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Claim a connection slot, or `None` at `max_connections`.
    #[must_use]
    pub fn try_reserve(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }
}

/// Holds one connection slot until dropped.
pub struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config)?);

    // Start metrics server if enabled
    if state.config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(state.config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    match state.config.transport.mode {
        TransportMode::Axum => serve_axum(state).await,
        TransportMode::Standalone => serve_standalone(state).await,
    }
}

async fn serve_axum(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr()?;
    let path = state.config.transport.websocket_path.clone();

    let app = Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Conduit server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn serve_standalone(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.bind_addr()?;
    let transport = WebSocketTransport::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        "Conduit server listening on ws://{}{} ({})",
        addr,
        state.config.transport.websocket_path,
        transport.name()
    );

    accept_loop(state, transport).await;
    Ok(())
}

/// Accept TCP streams forever, upgrading each on its own task.
async fn accept_loop(state: Arc<AppState>, transport: WebSocketTransport) {
    loop {
        match transport.accept_tcp().await {
            Ok((stream, remote)) => {
                tokio::spawn(accept_connection(state.clone(), stream, remote));
            }
            Err(e) => {
                debug!(error = %e, "Accept failed");
                metrics::record_error("accept");
            }
        }
    }
}

/// Finish the upgrade for one standalone client, then drive it.
async fn accept_connection(state: Arc<AppState>, stream: TcpStream, remote: SocketAddr) {
    let timeout = state.config.limits.handshake_timeout();
    let mut conn = match upgrade_within(stream, Some(remote), timeout).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(remote = %remote, error = %e, "Handshake failed");
            metrics::record_error("handshake");
            return;
        }
    };

    if conn.handshake.path != state.config.transport.websocket_path {
        debug!(path = %conn.handshake.path, "Rejecting unknown path");
        if let Err(e) = conn.sink.close(CLOSE_POLICY_VIOLATION, "Unknown path").await {
            trace!(error = %e, "Close failed");
        }
        return;
    }
    let Some(slot) = state.try_reserve() else {
        metrics::record_rejected();
        if let Err(e) = conn.sink.close(CLOSE_TRY_AGAIN_LATER, "Server full").await {
            trace!(error = %e, "Close failed");
        }
        return;
    };

    drive_connection(state, conn, slot).await;
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.groups.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "streams": state.bindings.streams(),
        "connections": state.active_connections(),
        "groups": stats.group_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(slot) = state.try_reserve() else {
        metrics::record_rejected();
        return (StatusCode::SERVICE_UNAVAILABLE, "Server full").into_response();
    };

    let handshake = upgrade::handshake_from_parts(uri.path(), uri.query(), &headers);
    ws.max_message_size(state.config.limits.max_message_size.saturating_mul(2))
        .on_upgrade(move |socket| {
            let conn = upgrade::into_connection(socket, handshake, Some(remote_addr));
            drive_connection(state, conn, slot)
        })
}

/// Drive one accepted connection until either side closes it.
///
/// `_slot` is released when the connection ends.
pub async fn drive_connection(state: Arc<AppState>, conn: Connection, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let Connection {
        id,
        handshake,
        remote_addr,
        mut source,
        sink,
    } = conn;
    let limits = &state.config.limits;

    let (reply, rx) = ReplyChannel::bounded(id.clone(), limits.reply_buffer);
    let mut mux = Multiplexer::new(
        state.bindings.clone(),
        state.dispatcher.clone(),
        reply,
        handshake.wire_format(),
    )
    .with_max_frame_size(limits.max_message_size);

    let ack = mux.connect(&handshake, state.authenticator.as_ref()).await;
    info!(
        connection = %ack.connection_id,
        remote = ?remote_addr,
        authenticated = ack.authenticated,
        username = ack.username.as_deref().unwrap_or("-"),
        "Connection accepted"
    );
    metrics::set_active_groups(state.groups.stats().group_count);

    let (close_tx, close_rx) = oneshot::channel();
    let outbound = EnvelopeCodec::new(mux.codec().format());
    let writer = tokio::spawn(write_loop(id.clone(), sink, rx, outbound, close_rx));

    let (code, reason) = loop {
        match source.recv().await {
            Ok(Some(frame)) => {
                metrics::record_frame(frame.len(), "inbound");
                let start = Instant::now();
                match mux.receive(&frame).await {
                    Ok(outcome) => {
                        metrics::record_dispatch(start.elapsed().as_secs_f64(), outcome.status);
                        trace!(
                            connection = %id,
                            stream = %outcome.stream,
                            action = %outcome.action,
                            status = outcome.status,
                            "Request handled"
                        );
                        if matches!(outcome.action.as_str(), "subscribe" | "unsubscribe") {
                            metrics::set_active_groups(state.groups.stats().group_count);
                        }
                    }
                    Err(e) => {
                        metrics::record_error("protocol");
                        break (e.close_code(), e.to_string());
                    }
                }
            }
            Ok(None) => break (CLOSE_NORMAL, String::new()),
            Err(e) => {
                debug!(connection = %id, error = %e, "Receive failed");
                metrics::record_error("transport");
                break (CLOSE_NORMAL, String::new());
            }
        }
    };

    mux.disconnect().await;
    drop(mux);
    metrics::set_active_groups(state.groups.stats().group_count);

    // The writer may already be gone if the socket failed first.
    let _ = close_tx.send((code, reason));
    if let Err(e) = writer.await {
        warn!(connection = %id, error = %e, "Writer task failed");
    }
}

/// Encode and send queued envelopes, then close with the reader's code.
async fn write_loop(
    connection: ConnectionId,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<Envelope>,
    codec: EnvelopeCodec,
    close_rx: oneshot::Receiver<(u16, String)>,
) {
    while let Some(envelope) = rx.recv().await {
        let frame = match codec.encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!(connection = %connection, error = %e, "Failed to encode envelope");
                metrics::record_error("encode");
                continue;
            }
        };
        let bytes = frame.len();
        if let Err(e) = sink.send(frame).await {
            debug!(connection = %connection, error = %e, "Send failed");
            metrics::record_error("transport");
            break;
        }
        metrics::record_frame(bytes, "outbound");
    }
    // Makes the reader's next reply fail, ending its loop.
    drop(rx);

    let (code, reason) = close_rx.await.unwrap_or((CLOSE_NORMAL, String::new()));
    if let Err(e) = sink.close(code, &reason).await {
        trace!(connection = %connection, error = %e, "Close failed");
    }
    debug!(connection = %connection, code, "Connection closed");
}
