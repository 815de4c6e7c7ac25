//! # conduit-protocol
//!
//! Wire protocol definitions for the Conduit realtime resource-binding engine.
//!
//! Every frame exchanged with a client is an [`Envelope`]: a stream tag naming
//! the bound resource plus an object payload. The payload shape depends on the
//! direction of the frame:
//!
//! - [`RequestPayload`] - client to server, `{action, pk, request_id, data}`
//! - [`ResponsePayload`] - server to client, `{action, request_id, data, errors, response_status}`
//! - [`NotificationPayload`] - server push, `{action, data, model, pk}`
//!
//! Envelopes travel as JSON text frames or MessagePack binary frames.
//!
//! ## Example
//!
//! ```rust
//! use conduit_protocol::{codec, Envelope, RequestPayload};
//!
//! let request = RequestPayload::new("retrieve").with_pk(1).with_request_id("req-1");
//! let envelope = Envelope::request("widget", request);
//!
//! let text = codec::encode_json(&envelope).unwrap();
//! let decoded = codec::decode_json(&text).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{
    decode, encode, EnvelopeCodec, ProtocolError, WireFormat, WireFrame, CLOSE_MESSAGE_TOO_BIG,
    CLOSE_POLICY_VIOLATION, CLOSE_UNSUPPORTED_DATA, MAX_FRAME_SIZE,
};
pub use envelope::{Envelope, NotificationPayload, Payload, RequestPayload, ResponsePayload};
