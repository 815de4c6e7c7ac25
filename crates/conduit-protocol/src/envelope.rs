//! Envelope types for the Conduit protocol.
//!
//! The envelope shape is identical in both directions. Only the payload
//! differs: requests name an action, responses carry a status and errors,
//! notifications describe a record change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::ProtocolError;

/// An envelope payload. Always an object, never a scalar.
pub type Payload = Map<String, Value>;

/// A multiplexed frame: stream tag plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Stream tag naming the bound resource.
    pub stream: String,
    /// Direction-specific payload.
    pub payload: Payload,
}

impl Envelope {
    /// Create an envelope from a raw payload.
    #[must_use]
    pub fn new(stream: impl Into<String>, payload: Payload) -> Self {
        Self {
            stream: stream.into(),
            payload,
        }
    }

    /// Create a request envelope.
    #[must_use]
    pub fn request(stream: impl Into<String>, request: RequestPayload) -> Self {
        Self::new(stream, request.into_payload())
    }

    /// Create a response envelope.
    #[must_use]
    pub fn response(stream: impl Into<String>, response: ResponsePayload) -> Self {
        Self::new(stream, response.into_payload())
    }

    /// Create a change notification envelope.
    #[must_use]
    pub fn notification(stream: impl Into<String>, notification: NotificationPayload) -> Self {
        Self::new(stream, notification.into_payload())
    }

    /// The `action` field of the payload, if present.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }
}

/// Client request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Action name (`create`, `list`, a custom action, ...).
    pub action: String,
    /// Record key for detail-scoped actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk: Option<Value>,
    /// Opaque client correlation value, echoed in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    /// Action input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RequestPayload {
    /// Create a request for an action with no key, id or data.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            pk: None,
            request_id: None,
            data: None,
        }
    }

    /// Set the record key.
    #[must_use]
    pub fn with_pk(mut self, pk: impl Into<Value>) -> Self {
        self.pk = Some(pk.into());
        self
    }

    /// Set the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<Value>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set the action input.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Parse a request out of an envelope payload.
    ///
    /// `null` values for `pk`, `request_id` and `data` are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if `action` is missing or any field has the wrong type.
    pub fn from_payload(payload: Payload) -> Result<Self, ProtocolError> {
        match payload.get("action") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingField("action")),
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err(ProtocolError::InvalidPayload(
                    "action must be a string".to_string(),
                ))
            }
        }
        serde_json::from_value(Value::Object(payload))
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Convert into an envelope payload.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        let mut payload = Map::new();
        payload.insert("action".to_string(), Value::String(self.action));
        if let Some(pk) = self.pk {
            payload.insert("pk".to_string(), pk);
        }
        if let Some(request_id) = self.request_id {
            payload.insert("request_id".to_string(), request_id);
        }
        if let Some(data) = self.data {
            payload.insert("data".to_string(), data);
        }
        payload
    }
}

/// Server response payload.
///
/// `request_id` and `data` serialize as `null` when absent; `errors` is empty
/// on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// The action as the client sent it.
    pub action: String,
    /// Echoed request id.
    pub request_id: Option<Value>,
    /// Action result.
    pub data: Option<Value>,
    /// Error descriptors, strings or field-error mappings.
    pub errors: Vec<Value>,
    /// HTTP-style status code.
    pub response_status: u16,
}

impl ResponsePayload {
    /// Create a successful response.
    #[must_use]
    pub fn success(
        action: impl Into<String>,
        request_id: Option<Value>,
        data: Option<Value>,
        status: u16,
    ) -> Self {
        Self {
            action: action.into(),
            request_id,
            data,
            errors: Vec::new(),
            response_status: status,
        }
    }

    /// Create an error response. `data` is always `null`.
    #[must_use]
    pub fn failure(
        action: impl Into<String>,
        request_id: Option<Value>,
        errors: Vec<Value>,
        status: u16,
    ) -> Self {
        Self {
            action: action.into(),
            request_id,
            data: None,
            errors,
            response_status: status,
        }
    }

    /// Check whether the status is in the 2xx range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.response_status)
    }

    /// Parse a response out of an envelope payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not have the response shape.
    pub fn from_payload(payload: Payload) -> Result<Self, ProtocolError> {
        serde_json::from_value(Value::Object(payload))
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    /// Convert into an envelope payload.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        let mut payload = Map::new();
        payload.insert("action".to_string(), Value::String(self.action));
        payload.insert(
            "request_id".to_string(),
            self.request_id.unwrap_or(Value::Null),
        );
        payload.insert("data".to_string(), self.data.unwrap_or(Value::Null));
        payload.insert("errors".to_string(), Value::Array(self.errors));
        payload.insert(
            "response_status".to_string(),
            Value::from(self.response_status),
        );
        payload
    }
}

/// Change notification pushed to group members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Group the change was published to (`create`, `update`, `delete`).
    pub action: String,
    /// Serialized record.
    pub data: Value,
    /// Resource identifier, e.g. `inventory.widget`.
    pub model: String,
    /// Record key.
    pub pk: Value,
}

impl NotificationPayload {
    /// Convert into an envelope payload.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        let mut payload = Map::new();
        payload.insert("action".to_string(), Value::String(self.action));
        payload.insert("data".to_string(), self.data);
        payload.insert("model".to_string(), Value::String(self.model));
        payload.insert("pk".to_string(), self.pk);
        payload
    }

    /// Parse a notification out of an envelope payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not have the notification shape.
    pub fn from_payload(payload: Payload) -> Result<Self, ProtocolError> {
        serde_json::from_value(Value::Object(payload))
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }
}
