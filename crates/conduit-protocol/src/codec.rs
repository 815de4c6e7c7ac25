//! Codec for encoding and decoding Conduit envelopes.
//!
//! Text frames carry JSON, binary frames carry MessagePack. Both decode through
//! the same structural checks so a malformed envelope is rejected the same way
//! regardless of encoding.

use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Websocket close code for policy violations.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Websocket close code for data that cannot be decoded.
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;

/// Websocket close code for oversized messages.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// Protocol errors that can occur during encoding/decoding or routing.
///
/// Every protocol error is fatal to the connection that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Frame is not an object.
    #[error("Invalid multiplexed frame received (not an object)")]
    NotAnObject,

    /// A required field is missing.
    #[error("Invalid multiplexed frame received (no {0} key)")]
    MissingField(&'static str),

    /// Stream tag is empty or not a string.
    #[error("Invalid multiplexed frame received (stream must be a non-empty string)")]
    InvalidStream,

    /// Payload is present but not an object.
    #[error("Multiplexed frame payload is not an object")]
    PayloadNotObject,

    /// Payload fields have the wrong shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// No binding is registered for the stream.
    #[error("Invalid multiplexed frame received (stream not mapped): {0}")]
    StreamNotMapped(String),

    /// Frame arrived after the connection closed.
    #[error("Connection is closed")]
    Closed,
}

impl ProtocolError {
    /// The websocket close code to send when this error terminates a connection.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::Json(_) | ProtocolError::Decode(_) => CLOSE_UNSUPPORTED_DATA,
            ProtocolError::FrameTooLarge { .. } => CLOSE_MESSAGE_TOO_BIG,
            _ => CLOSE_POLICY_VIOLATION,
        }
    }
}

/// Encoding used for outbound frames on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// MessagePack binary frames.
    MessagePack,
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "msgpack" | "messagepack" => Ok(WireFormat::MessagePack),
            other => Err(format!("unknown wire format: {other}")),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireFormat::Json => write!(f, "json"),
            WireFormat::MessagePack => write!(f, "msgpack"),
        }
    }
}

/// A transport-level message carrying one encoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Text frame (JSON).
    Text(String),
    /// Binary frame (MessagePack).
    Binary(Bytes),
}

impl WireFrame {
    /// Size of the frame in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    /// Check if the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Check the structure of a decoded value and turn it into an envelope.
fn into_envelope(value: Value) -> Result<Envelope, ProtocolError> {
    let Value::Object(mut frame) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let stream = match frame.remove("stream") {
        None => return Err(ProtocolError::MissingField("stream")),
        Some(Value::String(stream)) if !stream.is_empty() => stream,
        Some(_) => return Err(ProtocolError::InvalidStream),
    };

    match frame.remove("payload") {
        None => Err(ProtocolError::MissingField("payload")),
        Some(Value::Object(payload)) => Ok(Envelope { stream, payload }),
        Some(_) => Err(ProtocolError::PayloadNotObject),
    }
}

fn check_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Decode a JSON text frame.
///
/// # Errors
///
/// Returns an error if the text is not JSON or not a well-formed envelope.
pub fn decode_json(text: &str) -> Result<Envelope, ProtocolError> {
    check_size(text.len())?;
    into_envelope(serde_json::from_str(text)?)
}

/// Decode a MessagePack binary frame.
///
/// # Errors
///
/// Returns an error if the data is not MessagePack or not a well-formed envelope.
pub fn decode_msgpack(data: &[u8]) -> Result<Envelope, ProtocolError> {
    check_size(data.len())?;
    into_envelope(rmp_serde::from_slice(data)?)
}

/// Encode an envelope as JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_json(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    check_size(text.len())?;
    Ok(text)
}

/// Encode an envelope as MessagePack.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_msgpack(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let data = rmp_serde::to_vec_named(envelope)?;
    check_size(data.len())?;
    Ok(Bytes::from(data))
}

/// Decode a wire frame, choosing the decoder by frame kind.
///
/// # Errors
///
/// Returns an error if the frame is not a well-formed envelope.
pub fn decode(frame: &WireFrame) -> Result<Envelope, ProtocolError> {
    match frame {
        WireFrame::Text(text) => decode_json(text),
        WireFrame::Binary(data) => decode_msgpack(data),
    }
}

/// Encode an envelope into a wire frame of the given format.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(envelope: &Envelope, format: WireFormat) -> Result<WireFrame, ProtocolError> {
    match format {
        WireFormat::Json => encode_json(envelope).map(WireFrame::Text),
        WireFormat::MessagePack => encode_msgpack(envelope).map(WireFrame::Binary),
    }
}

/// Per-connection envelope codec.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeCodec {
    format: WireFormat,
    max_frame_size: usize,
}

impl EnvelopeCodec {
    /// Create a codec with the given outbound format.
    #[must_use]
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Lower the frame size limit. Values above [`MAX_FRAME_SIZE`] are clamped.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size.min(MAX_FRAME_SIZE);
        self
    }

    /// The outbound format.
    #[must_use]
    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode an envelope in this codec's format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the result exceeds the size limit.
    pub fn encode(&self, envelope: &Envelope) -> Result<WireFrame, ProtocolError> {
        let frame = encode(envelope, self.format)?;
        self.check(frame.len())?;
        Ok(frame)
    }

    /// Decode an inbound frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame exceeds the size limit or is malformed.
    pub fn decode(&self, frame: &WireFrame) -> Result<Envelope, ProtocolError> {
        self.check(frame.len())?;
        decode(frame)
    }

    fn check(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(WireFormat::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{RequestPayload, ResponsePayload};
    use serde_json::json;

    #[test]
    fn test_json_roundtrip() {
        let envelope = Envelope::request(
            "widget",
            RequestPayload::new("create")
                .with_request_id("client-request-id")
                .with_data(json!({"name": "some-thing"})),
        );

        let text = encode_json(&envelope).unwrap();
        assert_eq!(decode_json(&text).unwrap(), envelope);
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let envelope = Envelope::response(
            "widget",
            ResponsePayload::success("delete", Some(json!(7)), Some(json!({})), 200),
        );

        let frame = encode(&envelope, WireFormat::MessagePack).unwrap();
        assert!(matches!(frame, WireFrame::Binary(_)));
        assert_eq!(decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(decode_json("[1, 2]"), Err(ProtocolError::NotAnObject)));
        assert!(matches!(
            decode_json(r#"{"payload": {}}"#),
            Err(ProtocolError::MissingField("stream"))
        ));
        assert!(matches!(
            decode_json(r#"{"stream": "widget"}"#),
            Err(ProtocolError::MissingField("payload"))
        ));
        assert!(matches!(
            decode_json(r#"{"stream": "", "payload": {}}"#),
            Err(ProtocolError::InvalidStream)
        ));
        assert!(matches!(
            decode_json(r#"{"stream": 3, "payload": {}}"#),
            Err(ProtocolError::InvalidStream)
        ));
        assert!(matches!(
            decode_json(r#"{"stream": "widget", "payload": "text"}"#),
            Err(ProtocolError::PayloadNotObject)
        ));
        assert!(matches!(decode_json("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(ProtocolError::NotAnObject.close_code(), CLOSE_POLICY_VIOLATION);
        assert_eq!(
            ProtocolError::StreamNotMapped("x".into()).close_code(),
            CLOSE_POLICY_VIOLATION
        );
        let json_error = decode_json("{").unwrap_err();
        assert_eq!(json_error.close_code(), CLOSE_UNSUPPORTED_DATA);
    }

    #[test]
    fn test_codec_frame_limit() {
        let codec = EnvelopeCodec::new(WireFormat::Json).with_max_frame_size(32);
        let envelope = Envelope::request(
            "widget",
            RequestPayload::new("create").with_data(json!({"name": "x".repeat(64)})),
        );

        assert!(matches!(
            codec.encode(&envelope),
            Err(ProtocolError::FrameTooLarge { max: 32, .. })
        ));

        let frame = WireFrame::Text(encode_json(&envelope).unwrap());
        assert!(matches!(
            codec.decode(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_wire_format_parse() {
        assert_eq!("json".parse::<WireFormat>(), Ok(WireFormat::Json));
        assert_eq!("msgpack".parse::<WireFormat>(), Ok(WireFormat::MessagePack));
        assert!("xml".parse::<WireFormat>().is_err());
        assert_eq!(WireFormat::MessagePack.to_string(), "msgpack");
    }
}
