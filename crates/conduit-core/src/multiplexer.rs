//! Connection-level stream multiplexer.
//!
//! One [`Multiplexer`] exists per connection. It authenticates the handshake,
//! decodes inbound frames, routes each envelope to the binding named by its
//! stream tag and queues the tagged response on the connection's reply
//! channel. Frames are handled strictly in arrival order.
//!
//! ```text
//!   frame ─▶ decode ─▶ binding lookup ─▶ Dispatcher ─▶ response ─▶ reply channel
//!                                            │
//!                                            ▼
//!                                       GroupLayer ─▶ other connections
//! ```

use crate::auth::{Authenticator, Credentials, Handshake, Identity};
use crate::binding::BindingRegistry;
use crate::dispatch::{DispatchContext, Dispatcher};
use crate::session::{ConnectionId, ReplyChannel, Session};
use conduit_protocol::{
    Envelope, EnvelopeCodec, Payload, ProtocolError, RequestPayload, WireFormat, WireFrame,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Result of the connect handshake. Connections are always accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAck {
    pub connection_id: ConnectionId,
    pub authenticated: bool,
    pub username: Option<String>,
}

/// Summary of one handled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOutcome {
    pub stream: String,
    pub action: String,
    pub status: u16,
}

/// Per-connection protocol state machine.
pub struct Multiplexer {
    bindings: Arc<BindingRegistry>,
    dispatcher: Arc<Dispatcher>,
    session: Session,
    reply: ReplyChannel,
    codec: EnvelopeCodec,
    state: ConnectionState,
}

impl Multiplexer {
    /// Create a multiplexer for a freshly accepted connection.
    #[must_use]
    pub fn new(
        bindings: Arc<BindingRegistry>,
        dispatcher: Arc<Dispatcher>,
        reply: ReplyChannel,
        format: WireFormat,
    ) -> Self {
        let session = Session::new(reply.connection_id().clone(), format);
        Self {
            bindings,
            dispatcher,
            session,
            reply,
            codec: EnvelopeCodec::new(format),
            state: ConnectionState::Unauthenticated,
        }
    }

    /// Limit the size of inbound frames.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.codec = self.codec.with_max_frame_size(max_frame_size);
        self
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.session.connection_id()
    }

    /// Codec matching this connection's format and frame limit.
    #[must_use]
    pub fn codec(&self) -> EnvelopeCodec {
        self.codec
    }

    /// Authenticate the handshake and run every binding's connect hook.
    ///
    /// Failed or missing credentials leave the connection anonymous.
    pub async fn connect(
        &mut self,
        handshake: &Handshake,
        authenticator: &dyn Authenticator,
    ) -> ConnectAck {
        let identity = match Credentials::from_handshake(handshake) {
            Some(credentials) => authenticator
                .authenticate(&credentials)
                .await
                .map(Identity::Authenticated)
                .unwrap_or_default(),
            None => Identity::Anonymous,
        };

        self.state = if identity.is_authenticated() {
            ConnectionState::Authenticated
        } else {
            ConnectionState::Unauthenticated
        };
        self.session.set_identity(identity);

        for binding in self.bindings.iter() {
            self.dispatcher
                .on_connect(binding, self.session.identity(), &self.reply)
                .await;
        }

        let ack = ConnectAck {
            connection_id: self.connection_id().clone(),
            authenticated: self.session.identity().is_authenticated(),
            username: self.session.identity().username().map(str::to_string),
        };
        debug!(
            connection = %ack.connection_id,
            authenticated = ack.authenticated,
            username = ?ack.username,
            format = %self.session.format(),
            "Connection accepted"
        );
        ack
    }

    /// Handle one inbound frame and queue the response.
    ///
    /// # Errors
    ///
    /// Any error is fatal: the connection moves to [`ConnectionState::Closed`]
    /// and must be torn down.
    pub async fn receive(&mut self, frame: &WireFrame) -> Result<FrameOutcome, ProtocolError> {
        if self.state == ConnectionState::Closed {
            return Err(ProtocolError::Closed);
        }
        let decoded = self.codec.decode(frame);
        let envelope = self.fail_on_error(decoded)?;
        self.receive_envelope(envelope).await
    }

    /// Handle one decoded envelope and queue the response.
    ///
    /// # Errors
    ///
    /// Same as [`Multiplexer::receive`].
    pub async fn receive_envelope(
        &mut self,
        envelope: Envelope,
    ) -> Result<FrameOutcome, ProtocolError> {
        let response = self.handle_envelope(envelope).await?;
        let outcome = FrameOutcome {
            stream: response.stream.clone(),
            action: response.action().unwrap_or_default().to_string(),
            status: response
                .payload
                .get("response_status")
                .and_then(serde_json::Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or_default(),
        };

        if self.reply.send(response).await.is_err() {
            self.state = ConnectionState::Closed;
            return Err(ProtocolError::Closed);
        }
        Ok(outcome)
    }

    /// Route an envelope and return the tagged response without queueing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is not mapped or the payload is not a
    /// request.
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<Envelope, ProtocolError> {
        if self.state == ConnectionState::Closed {
            return Err(ProtocolError::Closed);
        }
        self.session.touch();

        let Envelope { stream, payload } = envelope;
        let result = self.route(stream, payload).await;
        self.fail_on_error(result)
    }

    async fn route(&self, stream: String, payload: Payload) -> Result<Envelope, ProtocolError> {
        let Some(binding) = self.bindings.get(&stream) else {
            return Err(ProtocolError::StreamNotMapped(stream));
        };
        let request = RequestPayload::from_payload(payload)?;

        trace!(
            connection = %self.connection_id(),
            stream = %stream,
            action = %request.action,
            "Routing request"
        );

        let ctx = DispatchContext {
            identity: self.session.identity(),
            reply: &self.reply,
        };
        let response = self.dispatcher.dispatch(binding, ctx, request).await;
        Ok(Envelope::response(stream, response))
    }

    fn fail_on_error<T>(&mut self, result: Result<T, ProtocolError>) -> Result<T, ProtocolError> {
        if let Err(e) = &result {
            if !matches!(e, ProtocolError::Closed) {
                warn!(connection = %self.connection_id(), error = %e, "Protocol error");
            }
            self.state = ConnectionState::Closed;
        }
        result
    }

    /// Remove every group membership and close the connection.
    ///
    /// Returns the number of memberships removed.
    pub async fn disconnect(&mut self) -> usize {
        self.state = ConnectionState::Closed;
        let removed = self
            .dispatcher
            .groups()
            .remove_connection(self.session.connection_id())
            .await;
        debug!(
            connection = %self.connection_id(),
            memberships = removed,
            frames = self.session.frames_processed(),
            age_secs = self.session.age().as_secs_f64(),
            "Connection closed"
        );
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthenticator;
    use crate::binding::{AutoSubscribe, Binding};
    use crate::codec::{FieldKind, FieldSpec, SchemaCodec};
    use crate::registry::GroupRegistry;
    use crate::source::MemoryStore;
    use conduit_protocol::ResponsePayload;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn setup(auto_subscribe: bool) -> (Arc<BindingRegistry>, Arc<Dispatcher>, Arc<GroupRegistry>) {
        let mut builder = Binding::builder(
            "widget",
            "inventory.widget",
            Arc::new(MemoryStore::new()),
            Arc::new(SchemaCodec::new(vec![FieldSpec::new("name", FieldKind::String)])),
        );
        if auto_subscribe {
            builder = builder.on_connect(AutoSubscribe::new(["create"]).authenticated_only());
        }

        let mut bindings = BindingRegistry::new();
        bindings.register(builder.build()).unwrap();
        let registry = Arc::new(GroupRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone()));
        (Arc::new(bindings), dispatcher, registry)
    }

    fn connection(
        bindings: &Arc<BindingRegistry>,
        dispatcher: &Arc<Dispatcher>,
        id: &str,
    ) -> (Multiplexer, mpsc::Receiver<Envelope>) {
        let (reply, rx) = ReplyChannel::bounded(id.into(), 16);
        let mux = Multiplexer::new(bindings.clone(), dispatcher.clone(), reply, WireFormat::Json);
        (mux, rx)
    }

    fn text(value: Value) -> WireFrame {
        WireFrame::Text(value.to_string())
    }

    #[tokio::test]
    async fn test_connect_authenticates_from_query() {
        let (bindings, dispatcher, _) = setup(false);
        let auth = StaticAuthenticator::new().with_user("john", "secret", false);

        let (mut mux, _rx) = connection(&bindings, &dispatcher, "conn-1");
        let ack = mux
            .connect(&Handshake::new("/ws").with_query("username=john&password=secret"), &auth)
            .await;
        assert!(ack.authenticated);
        assert_eq!(ack.username.as_deref(), Some("john"));
        assert_eq!(mux.state(), ConnectionState::Authenticated);

        let (mut anon, _rx) = connection(&bindings, &dispatcher, "conn-2");
        let ack = anon
            .connect(&Handshake::new("/ws").with_query("username=john&password=nope"), &auth)
            .await;
        assert!(!ack.authenticated);
        assert_eq!(anon.state(), ConnectionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_receive_routes_and_tags_response() {
        let (bindings, dispatcher, _) = setup(false);
        let (mut mux, mut rx) = connection(&bindings, &dispatcher, "conn-1");

        let outcome = mux
            .receive(&text(json!({
                "stream": "widget",
                "payload": {"action": "create", "request_id": "r1", "data": {"name": "A"}}
            })))
            .await
            .unwrap();
        assert_eq!(outcome.stream, "widget");
        assert_eq!(outcome.action, "create");
        assert_eq!(outcome.status, 201);

        let response = rx.recv().await.unwrap();
        assert_eq!(response.stream, "widget");
        let payload = ResponsePayload::from_payload(response.payload).unwrap();
        assert_eq!(payload.request_id, Some(json!("r1")));
        assert_eq!(payload.data, Some(json!({"id": 1, "name": "A"})));
        assert_eq!(mux.session().frames_processed(), 1);
    }

    #[tokio::test]
    async fn test_protocol_errors_close_the_connection() {
        let (bindings, dispatcher, _) = setup(false);

        for frame in [
            text(json!([1])),
            text(json!({"payload": {"action": "list"}})),
            text(json!({"stream": "widget"})),
            text(json!({"stream": "widget", "payload": 3})),
            text(json!({"stream": "widget", "payload": {}})),
            text(json!({"stream": "gadget", "payload": {"action": "list"}})),
            WireFrame::Text("not json".into()),
        ] {
            let (mut mux, _rx) = connection(&bindings, &dispatcher, "conn-1");
            assert!(mux.receive(&frame).await.is_err());
            assert_eq!(mux.state(), ConnectionState::Closed);

            let next = text(json!({"stream": "widget", "payload": {"action": "list"}}));
            assert!(matches!(mux.receive(&next).await, Err(ProtocolError::Closed)));
        }
    }

    #[tokio::test]
    async fn test_frame_size_limit() {
        let (bindings, dispatcher, _) = setup(false);
        let (mux, _rx) = connection(&bindings, &dispatcher, "conn-1");
        let mut mux = mux.with_max_frame_size(64);

        let frame = text(json!({
            "stream": "widget",
            "payload": {"action": "create", "data": {"name": "x".repeat(128)}}
        }));
        let err = mux.receive(&frame).await.unwrap_err();
        assert_eq!(err.close_code(), conduit_protocol::CLOSE_MESSAGE_TOO_BIG);
    }

    #[tokio::test]
    async fn test_msgpack_frames() {
        let (bindings, dispatcher, _) = setup(false);
        let (mut mux, mut rx) = connection(&bindings, &dispatcher, "conn-1");

        let request = Envelope::request("widget", RequestPayload::new("list"));
        let frame = conduit_protocol::encode(&request, WireFormat::MessagePack).unwrap();
        let outcome = mux.receive(&frame).await.unwrap();
        assert_eq!(outcome.status, 200);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_auto_subscribe_and_disconnect() {
        let (bindings, dispatcher, registry) = setup(true);
        let auth = StaticAuthenticator::new().with_user("john", "secret", false);

        let (mut anon, _rx) = connection(&bindings, &dispatcher, "conn-anon");
        anon.connect(&Handshake::new("/ws"), &auth).await;
        assert_eq!(registry.stats().total_memberships, 0);

        let (mut user, _rx) = connection(&bindings, &dispatcher, "conn-user");
        user.connect(
            &Handshake::new("/ws")
                .with_field("username", "john")
                .with_field("password", "secret"),
            &auth,
        )
        .await;
        assert_eq!(registry.stats().total_memberships, 1);

        assert_eq!(user.disconnect().await, 1);
        assert_eq!(registry.stats().total_memberships, 0);
        assert_eq!(user.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_receive_after_writer_gone() {
        let (bindings, dispatcher, _) = setup(false);
        let (mut mux, rx) = connection(&bindings, &dispatcher, "conn-1");
        drop(rx);

        let frame = text(json!({"stream": "widget", "payload": {"action": "list"}}));
        assert!(matches!(mux.receive(&frame).await, Err(ProtocolError::Closed)));
        assert_eq!(mux.state(), ConnectionState::Closed);
    }
}
