//! Permission evaluators.
//!
//! A binding holds an ordered list of evaluators and grants an action only if
//! every one of them allows it.

use crate::auth::Identity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A stateless permission predicate.
///
/// Implementations must accept [`Identity::Anonymous`] without failing.
pub trait Permission: Send + Sync + fmt::Debug {
    /// Decide whether `identity` may run `action` against the record `pk`.
    fn has_permission(&self, identity: &Identity, action: &str, pk: Option<&Value>) -> bool;
}

/// Allows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAny;

impl Permission for AllowAny {
    fn has_permission(&self, _identity: &Identity, _action: &str, _pk: Option<&Value>) -> bool {
        true
    }
}

/// Allows authenticated users only.
#[derive(Debug, Default, Clone, Copy)]
pub struct IsAuthenticated;

impl Permission for IsAuthenticated {
    fn has_permission(&self, identity: &Identity, _action: &str, _pk: Option<&Value>) -> bool {
        identity.is_authenticated()
    }
}

/// Allows superusers only.
#[derive(Debug, Default, Clone, Copy)]
pub struct IsSuperuser;

impl Permission for IsSuperuser {
    fn has_permission(&self, identity: &Identity, _action: &str, _pk: Option<&Value>) -> bool {
        identity.is_superuser()
    }
}

/// Allows only actions that do not change records.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOnly;

/// Actions [`ReadOnly`] lets through.
pub const SAFE_ACTIONS: &[&str] = &["retrieve", "list", "subscribe", "unsubscribe"];

impl Permission for ReadOnly {
    fn has_permission(&self, _identity: &Identity, action: &str, _pk: Option<&Value>) -> bool {
        SAFE_ACTIONS.contains(&action)
    }
}

/// Built-in permission kinds, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    AllowAny,
    IsAuthenticated,
    IsSuperuser,
    ReadOnly,
}

impl PermissionKind {
    /// Instantiate the evaluator.
    #[must_use]
    pub fn build(self) -> Arc<dyn Permission> {
        match self {
            PermissionKind::AllowAny => Arc::new(AllowAny),
            PermissionKind::IsAuthenticated => Arc::new(IsAuthenticated),
            PermissionKind::IsSuperuser => Arc::new(IsSuperuser),
            PermissionKind::ReadOnly => Arc::new(ReadOnly),
        }
    }
}

/// Evaluate a permission sequence. Empty sequences allow everything.
#[must_use]
pub fn check_all(
    permissions: &[Arc<dyn Permission>],
    identity: &Identity,
    action: &str,
    pk: Option<&Value>,
) -> bool {
    permissions
        .iter()
        .all(|p| p.has_permission(identity, action, pk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::User;

    fn user(is_superuser: bool) -> Identity {
        Identity::Authenticated(User {
            id: 1,
            username: "john".into(),
            is_superuser,
        })
    }

    #[test]
    fn test_builtin_permissions() {
        let anonymous = Identity::Anonymous;

        assert!(AllowAny.has_permission(&anonymous, "delete", None));
        assert!(!IsAuthenticated.has_permission(&anonymous, "list", None));
        assert!(IsAuthenticated.has_permission(&user(false), "list", None));
        assert!(!IsSuperuser.has_permission(&anonymous, "list", None));
        assert!(!IsSuperuser.has_permission(&user(false), "list", None));
        assert!(IsSuperuser.has_permission(&user(true), "list", None));
    }

    #[test]
    fn test_read_only() {
        let anonymous = Identity::Anonymous;
        assert!(ReadOnly.has_permission(&anonymous, "retrieve", None));
        assert!(ReadOnly.has_permission(&anonymous, "subscribe", None));
        assert!(!ReadOnly.has_permission(&anonymous, "create", None));
        assert!(!ReadOnly.has_permission(&anonymous, "partial_update", None));
    }

    #[test]
    fn test_check_all_requires_every_permission() {
        let permissions = vec![
            PermissionKind::IsAuthenticated.build(),
            PermissionKind::IsSuperuser.build(),
        ];

        assert!(!check_all(&permissions, &Identity::Anonymous, "create", None));
        assert!(!check_all(&permissions, &user(false), "create", None));
        assert!(check_all(&permissions, &user(true), "create", None));
        assert!(check_all(&[], &Identity::Anonymous, "create", None));
    }

    #[test]
    fn test_permission_kind_names() {
        let kinds: Vec<PermissionKind> =
            serde_json::from_str(r#"["allow_any", "is_authenticated", "read_only"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![
                PermissionKind::AllowAny,
                PermissionKind::IsAuthenticated,
                PermissionKind::ReadOnly
            ]
        );
    }
}
