//! Group registry and change fan-out.
//!
//! The registry tracks which connections belong to which notification
//! groups and pushes envelopes to every member's reply channel.

use crate::event::ChangeEvent;
use crate::group::{validate_group_name, GroupKey};
use crate::session::{ConnectionId, Delivery, ReplyChannel};
use async_trait::async_trait;
use conduit_protocol::Envelope;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Group registry errors.
#[derive(Debug, Error)]
pub enum GroupError {
    /// Invalid group name.
    #[error("Invalid group name: {0}")]
    InvalidGroup(&'static str),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Members the envelope was queued for.
    pub delivered: usize,
    /// Members skipped because their channel was full or closed.
    pub dropped: usize,
}

impl DeliveryReport {
    /// Total members addressed.
    #[must_use]
    pub fn recipients(&self) -> usize {
        self.delivered + self.dropped
    }
}

/// Group membership and fan-out backend.
///
/// [`GroupRegistry`] keeps everything in process memory; other
/// implementations may distribute groups across processes.
#[async_trait]
pub trait GroupLayer: Send + Sync {
    /// Add a connection to a group. Returns `false` if it was already a member.
    async fn subscribe(&self, reply: &ReplyChannel, group: GroupKey) -> Result<bool, GroupError>;

    /// Remove a connection from a group. Returns `false` if it was not a member.
    async fn unsubscribe(&self, connection: &ConnectionId, group: &GroupKey) -> bool;

    /// Remove every membership of a connection. Returns how many were removed.
    async fn remove_connection(&self, connection: &ConnectionId) -> usize;

    /// Deliver an envelope to the members of the given groups, once per
    /// connection.
    async fn group_send(&self, groups: &[GroupKey], envelope: &Envelope) -> DeliveryReport;

    /// Fan a change event out on a stream.
    async fn notify(&self, stream: &str, event: &ChangeEvent) -> DeliveryReport {
        let groups = event.groups(stream);
        self.group_send(&groups, &event.to_envelope(stream)).await
    }
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum group memberships per connection.
    pub max_subscriptions_per_connection: usize,
    /// Whether to delete groups once their last member leaves.
    pub auto_delete_empty_groups: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
            auto_delete_empty_groups: true,
        }
    }
}

/// In-memory group registry.
///
/// Two indexes are kept consistent: group to members, and connection to
/// groups. Locks are always taken in that order: `memberships` first, then
/// `groups`. No guard is held while delivering.
pub struct GroupRegistry {
    /// Members indexed by group.
    groups: DashMap<GroupKey, HashMap<ConnectionId, ReplyChannel>>,
    /// Groups indexed by connection.
    memberships: DashMap<ConnectionId, HashSet<GroupKey>>,
    config: RegistryConfig,
}

impl GroupRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating group registry with config: {:?}", config);
        Self {
            groups: DashMap::new(),
            memberships: DashMap::new(),
            config,
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            group_count: self.groups.len(),
            connection_count: self.memberships.len(),
            total_memberships: self.memberships.iter().map(|m| m.len()).sum(),
        }
    }

    /// Add a connection to a group.
    ///
    /// Returns `Ok(false)` if the connection was already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the group name is invalid or the connection is at
    /// its membership limit.
    pub fn join(&self, reply: &ReplyChannel, group: GroupKey) -> Result<bool, GroupError> {
        validate_group_name(&group.action).map_err(GroupError::InvalidGroup)?;

        let connection = reply.connection_id();
        let mut joined = self.memberships.entry(connection.clone()).or_default();

        if joined.contains(&group) {
            return Ok(false);
        }
        if joined.len() >= self.config.max_subscriptions_per_connection {
            return Err(GroupError::MaxSubscriptionsReached);
        }

        let mut members = self.groups.entry(group.clone()).or_insert_with(|| {
            debug!(group = %group, "Creating group");
            HashMap::new()
        });
        members.insert(connection.clone(), reply.clone());
        let subscribers = members.len();
        drop(members);

        debug!(group = %group, connection = %connection, subscribers, "Joined group");
        joined.insert(group);
        Ok(true)
    }

    /// Remove a connection from a group.
    pub fn leave(&self, connection: &ConnectionId, group: &GroupKey) -> bool {
        let removed = match self.memberships.get_mut(connection) {
            Some(mut joined) => joined.remove(group),
            None => false,
        };
        if !removed {
            return false;
        }

        self.memberships
            .remove_if(connection, |_, joined| joined.is_empty());
        self.detach(connection, group);
        debug!(group = %group, connection = %connection, "Left group");
        true
    }

    /// Remove a connection from all groups.
    pub fn leave_all(&self, connection: &ConnectionId) -> usize {
        let Some((_, joined)) = self.memberships.remove(connection) else {
            return 0;
        };

        for group in &joined {
            self.detach(connection, group);
        }

        debug!(connection = %connection, groups = joined.len(), "Left all groups");
        joined.len()
    }

    fn detach(&self, connection: &ConnectionId, group: &GroupKey) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(connection);
        }
        if self.config.auto_delete_empty_groups
            && self
                .groups
                .remove_if(group, |_, members| members.is_empty())
                .is_some()
        {
            debug!(group = %group, "Deleted empty group");
        }
    }

    /// Deliver an envelope to the members of the given groups.
    ///
    /// A connection in more than one of the groups receives the envelope once.
    pub fn broadcast(&self, groups: &[GroupKey], envelope: &Envelope) -> DeliveryReport {
        let mut recipients: HashMap<ConnectionId, ReplyChannel> = HashMap::new();
        for group in groups {
            if let Some(members) = self.groups.get(group) {
                for (connection, reply) in members.iter() {
                    recipients
                        .entry(connection.clone())
                        .or_insert_with(|| reply.clone());
                }
            }
        }

        let mut report = DeliveryReport::default();
        for (connection, reply) in recipients {
            match reply.try_deliver(envelope.clone()) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Full => {
                    warn!(
                        connection = %connection,
                        stream = %envelope.stream,
                        "Reply channel full, notification dropped"
                    );
                    report.dropped += 1;
                }
                Delivery::Closed => {
                    debug!(connection = %connection, "Notification to closed connection skipped");
                    report.dropped += 1;
                }
            }
        }

        trace!(
            stream = %envelope.stream,
            delivered = report.delivered,
            dropped = report.dropped,
            "Broadcast"
        );
        report
    }

    /// Check if a group exists.
    #[must_use]
    pub fn group_exists(&self, group: &GroupKey) -> bool {
        self.groups.contains_key(group)
    }

    /// Get the member count of a group.
    #[must_use]
    pub fn subscriber_count(&self, group: &GroupKey) -> usize {
        self.groups.get(group).map(|m| m.len()).unwrap_or(0)
    }

    /// Get the groups a connection belongs to.
    #[must_use]
    pub fn connection_groups(&self, connection: &ConnectionId) -> Vec<GroupKey> {
        self.memberships
            .get(connection)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupLayer for GroupRegistry {
    async fn subscribe(&self, reply: &ReplyChannel, group: GroupKey) -> Result<bool, GroupError> {
        self.join(reply, group)
    }

    async fn unsubscribe(&self, connection: &ConnectionId, group: &GroupKey) -> bool {
        self.leave(connection, group)
    }

    async fn remove_connection(&self, connection: &ConnectionId) -> usize {
        self.leave_all(connection)
    }

    async fn group_send(&self, groups: &[GroupKey], envelope: &Envelope) -> DeliveryReport {
        self.broadcast(groups, envelope)
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of non-empty groups.
    pub group_count: usize,
    /// Number of connections with at least one membership.
    pub connection_count: usize,
    /// Total number of memberships.
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeKind;
    use serde_json::{json, Map};

    fn create_group() -> GroupKey {
        GroupKey::new("widget", "create")
    }

    #[test]
    fn test_join_leave() {
        let registry = GroupRegistry::new();
        let (reply, _rx) = ReplyChannel::bounded("conn-1".into(), 8);

        assert!(registry.join(&reply, create_group()).unwrap());
        assert!(registry.group_exists(&create_group()));
        assert_eq!(registry.subscriber_count(&create_group()), 1);

        assert!(registry.leave(reply.connection_id(), &create_group()));
        assert!(!registry.group_exists(&create_group()));
        assert!(!registry.leave(reply.connection_id(), &create_group()));
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = GroupRegistry::new();
        let (reply, _rx) = ReplyChannel::bounded("conn-1".into(), 8);

        assert!(registry.join(&reply, create_group()).unwrap());
        assert!(!registry.join(&reply, create_group()).unwrap());
        assert_eq!(registry.stats().total_memberships, 1);
    }

    #[test]
    fn test_join_limits() {
        let registry = GroupRegistry::with_config(RegistryConfig {
            max_subscriptions_per_connection: 1,
            ..Default::default()
        });
        let (reply, _rx) = ReplyChannel::bounded("conn-1".into(), 8);

        registry.join(&reply, create_group()).unwrap();
        assert!(matches!(
            registry.join(&reply, GroupKey::new("widget", "delete")),
            Err(GroupError::MaxSubscriptionsReached)
        ));
        assert!(matches!(
            registry.join(&reply, GroupKey::new("widget", "")),
            Err(GroupError::InvalidGroup(_))
        ));
    }

    #[test]
    fn test_leave_all_cleans_both_indexes() {
        let registry = GroupRegistry::new();
        let (reply, _rx) = ReplyChannel::bounded("conn-1".into(), 8);

        registry.join(&reply, create_group()).unwrap();
        registry.join(&reply, GroupKey::new("widget", "update")).unwrap();

        assert_eq!(registry.leave_all(reply.connection_id()), 2);
        assert!(registry.connection_groups(reply.connection_id()).is_empty());
        let stats = registry.stats();
        assert_eq!(stats.group_count, 0);
        assert_eq!(stats.connection_count, 0);
        assert_eq!(registry.leave_all(reply.connection_id()), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member_once() {
        let registry = GroupRegistry::new();
        let (reply1, mut rx1) = ReplyChannel::bounded("conn-1".into(), 8);
        let (reply2, mut rx2) = ReplyChannel::bounded("conn-2".into(), 8);

        let event = ChangeEvent {
            kind: ChangeKind::Create,
            model: "inventory.widget".into(),
            pk: json!(1),
            data: json!({"id": 1}),
        };
        let [model_group, instance_group] = event.groups("widget");

        registry.join(&reply1, model_group.clone()).unwrap();
        registry.join(&reply1, instance_group).unwrap();
        registry.join(&reply2, model_group).unwrap();

        let report = registry.notify("widget", &event).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 0);

        assert_eq!(rx1.recv().await.unwrap().action(), Some("create"));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.recv().await.unwrap().stream, "widget");
    }

    #[test]
    fn test_broadcast_skips_full_and_closed_channels() {
        let registry = GroupRegistry::new();
        let (full, _full_rx) = ReplyChannel::bounded("conn-full".into(), 1);
        let (closed, closed_rx) = ReplyChannel::bounded("conn-closed".into(), 8);
        drop(closed_rx);

        registry.join(&full, create_group()).unwrap();
        registry.join(&closed, create_group()).unwrap();

        let envelope = Envelope::new("widget", Map::new());
        let first = registry.broadcast(&[create_group()], &envelope);
        assert_eq!(first.delivered, 1);
        assert_eq!(first.dropped, 1);

        let second = registry.broadcast(&[create_group()], &envelope);
        assert_eq!(second.delivered, 0);
        assert_eq!(second.recipients(), 2);
    }

    #[test]
    fn test_stats() {
        let registry = GroupRegistry::new();
        let (reply1, _rx1) = ReplyChannel::bounded("conn-1".into(), 8);
        let (reply2, _rx2) = ReplyChannel::bounded("conn-2".into(), 8);

        registry.join(&reply1, create_group()).unwrap();
        registry.join(&reply1, GroupKey::new("widget", "delete")).unwrap();
        registry.join(&reply2, create_group()).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.group_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_memberships, 3);
    }
}
