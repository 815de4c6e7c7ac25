//! Record change events.

use crate::group::GroupKey;
use conduit_protocol::{Envelope, NotificationPayload};
use serde_json::Value;

/// Kind of record change, which is also the group the change is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    /// Group name this change is published under.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A change to one record, ready for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Resource identifier, e.g. `inventory.widget`.
    pub model: String,
    pub pk: Value,
    /// Serialized record. For deletes, the record as it was before deletion.
    pub data: Value,
}

impl ChangeEvent {
    /// Groups that receive this event: the model-wide group and the record's
    /// instance group.
    #[must_use]
    pub fn groups(&self, stream: &str) -> [GroupKey; 2] {
        let action = self.kind.as_str();
        [
            GroupKey::new(stream, action),
            GroupKey::for_instance(stream, action, &self.pk),
        ]
    }

    /// Build the notification envelope for a stream.
    #[must_use]
    pub fn to_envelope(&self, stream: &str) -> Envelope {
        Envelope::notification(
            stream,
            NotificationPayload {
                action: self.kind.as_str().to_string(),
                data: self.data.clone(),
                model: self.model.clone(),
                pk: self.pk.clone(),
            },
        )
    }
}
