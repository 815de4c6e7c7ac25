//! Builds the binding table and authenticator from configuration.

use crate::config::{AuthConfig, BindingConfig, Config};
use anyhow::{Context, Result};
use std::sync::Arc;
use tenvis_conduit_core::{
    AutoSubscribe, Binding, BindingRegistry, MemoryStore, SchemaCodec, StaticAuthenticator,
};
use tracing::info;

/// Build one in-memory binding per `[[bindings]]` entry.
///
/// # Errors
///
/// Returns an error if two entries share a stream or a stream is empty.
pub fn build_registry(config: &Config) -> Result<BindingRegistry> {
    let mut registry = BindingRegistry::new();
    for entry in &config.bindings {
        let binding = build_binding(config, entry);
        info!(
            stream = %binding.stream(),
            model = %binding.model(),
            actions = ?binding.actions(),
            "Registered binding"
        );
        registry
            .register(binding)
            .with_context(|| format!("Invalid binding for stream {:?}", entry.stream))?;
    }
    Ok(registry)
}

fn build_binding(config: &Config, entry: &BindingConfig) -> Binding {
    let model = entry.model.clone().unwrap_or_else(|| entry.stream.clone());
    let codec = SchemaCodec::new(entry.fields.clone());
    let permissions = entry
        .permissions
        .as_ref()
        .unwrap_or(&config.defaults.permissions)
        .iter()
        .map(|kind| kind.build());

    let mut builder = Binding::builder(
        entry.stream.as_str(),
        model,
        Arc::new(MemoryStore::new()),
        Arc::new(codec),
    )
    .permissions(permissions)
    .page_size(entry.page_size.unwrap_or(config.defaults.page_size));

    if entry.read_only {
        builder = builder.read_only();
    }
    if !entry.auto_subscribe.is_empty() {
        builder = builder.on_connect(AutoSubscribe::new(entry.auto_subscribe.iter().cloned()));
    }
    builder.build()
}

/// Build the username/password table from `[[auth.users]]`.
#[must_use]
pub fn build_authenticator(auth: &AuthConfig) -> StaticAuthenticator {
    auth.users
        .iter()
        .fold(StaticAuthenticator::new(), |authenticator, user| {
            authenticator.with_user(user.username.as_str(), user.password.as_str(), user.superuser)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use tenvis_conduit_core::{BuiltinAction, FieldKind, FieldSpec, PermissionKind};

    fn entry(stream: &str) -> BindingConfig {
        BindingConfig {
            stream: stream.into(),
            model: None,
            page_size: None,
            permissions: None,
            read_only: false,
            fields: vec![FieldSpec::new("name", FieldKind::String)],
            auto_subscribe: Vec::new(),
        }
    }

    #[test]
    fn test_build_registry_applies_defaults() {
        let mut config = Config::default();
        config.defaults.page_size = 10;
        config.bindings.push(entry("widget"));

        let registry = build_registry(&config).unwrap();
        let binding = registry.get("widget").unwrap();
        assert_eq!(binding.model(), "widget");
        assert_eq!(binding.page_size(), 10);
        assert_eq!(binding.permissions().len(), 1);
        assert!(binding.connect_hook().is_none());
    }

    #[test]
    fn test_build_registry_entry_overrides() {
        let mut config = Config::default();
        let mut widget = entry("widget");
        widget.model = Some("inventory.widget".into());
        widget.page_size = Some(2);
        widget.permissions = Some(vec![PermissionKind::IsAuthenticated, PermissionKind::ReadOnly]);
        widget.read_only = true;
        widget.auto_subscribe = vec!["create".into()];
        config.bindings.push(widget);

        let registry = build_registry(&config).unwrap();
        let binding = registry.get("widget").unwrap();
        assert_eq!(binding.model(), "inventory.widget");
        assert_eq!(binding.page_size(), 2);
        assert_eq!(binding.permissions().len(), 2);
        assert!(binding.connect_hook().is_some());
        assert!(binding.resolve(BuiltinAction::Create.as_str()).is_none());
        assert!(binding.resolve(BuiltinAction::List.as_str()).is_some());
    }

    #[test]
    fn test_build_registry_rejects_duplicate_streams() {
        let mut config = Config::default();
        config.bindings.push(entry("widget"));
        config.bindings.push(entry("widget"));
        assert!(build_registry(&config).is_err());
    }

    #[test]
    fn test_build_authenticator() {
        let auth = AuthConfig {
            users: vec![
                UserConfig {
                    username: "admin".into(),
                    password: "secret".into(),
                    superuser: true,
                },
                UserConfig {
                    username: "john".into(),
                    password: "doe".into(),
                    superuser: false,
                },
            ],
        };
        assert_eq!(build_authenticator(&auth).len(), 2);
        assert!(build_authenticator(&AuthConfig::default()).is_empty());
    }
}
