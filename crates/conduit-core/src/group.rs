//! Notification group keys.
//!
//! A group is a `(stream, action)` bucket. Instance groups additionally carry
//! a record key and only receive changes to that record.

use serde_json::Value;
use std::fmt;

/// Maximum group name length, in bytes.
pub const MAX_GROUP_NAME_LENGTH: usize = 256;

/// Validate the action name a client subscribes to.
///
/// # Errors
///
/// Returns an error message if the name is empty, too long or contains
/// non-printable characters.
pub fn validate_group_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Group name cannot be empty");
    }
    if name.len() > MAX_GROUP_NAME_LENGTH {
        return Err("Group name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Group name contains invalid characters");
    }
    Ok(())
}

/// Identifies one notification group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// Stream of the binding.
    pub stream: String,
    /// Subscribed action (`create`, `update`, `delete`).
    pub action: String,
    /// Record key for instance groups.
    pub pk: Option<String>,
}

impl GroupKey {
    /// A model-wide group.
    #[must_use]
    pub fn new(stream: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            action: action.into(),
            pk: None,
        }
    }

    /// A group for a single record.
    ///
    /// String keys are used as-is so that `"3"` and `3` name the same group.
    #[must_use]
    pub fn for_instance(
        stream: impl Into<String>,
        action: impl Into<String>,
        pk: &Value,
    ) -> Self {
        let pk = match pk {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            stream: stream.into(),
            action: action.into(),
            pk: Some(pk),
        }
    }

    /// Check if this is an instance group.
    #[must_use]
    pub fn is_instance(&self) -> bool {
        self.pk.is_some()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pk {
            Some(pk) => write!(f, "{}-{}-{}", self.stream, self.action, pk),
            None => write!(f, "{}-{}", self.stream, self.action),
        }
    }
}
