//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file given with `--config`
//! - The first of `conduit.toml`, `/etc/conduit/conduit.toml` and
//!   `~/.config/conduit/conduit.toml` that exists, layered with
//!   `CONDUIT__*` environment variables (`CONDUIT__LIMITS__REPLY_BUFFER=512`)
//! - `CONDUIT_HOST` / `CONDUIT_PORT` for the listen address defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_conduit_core::{FieldSpec, PermissionKind, DEFAULT_PAGE_SIZE};

/// Default config file locations, in lookup order.
const CONFIG_PATHS: [&str; 3] = [
    "conduit.toml",
    "/etc/conduit/conduit.toml",
    "~/.config/conduit/conduit.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Known users.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Defaults applied to every binding.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Resource bindings, one per stream.
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

/// How websocket connections are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Upgrade through an axum route, next to `/health`.
    #[default]
    Axum,
    /// Bare tokio-tungstenite listener.
    Standalone,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub mode: TransportMode,

    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum group memberships per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_reply_buffer")]
    pub reply_buffer: usize,

    /// Seconds a standalone client gets to finish the websocket upgrade.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl LimitsConfig {
    /// Handshake deadline as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// One entry of `[[auth.users]]`.
#[derive(Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub superuser: bool,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("username", &self.username)
            .field("superuser", &self.superuser)
            .finish_non_exhaustive()
    }
}

/// Binding defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Permission sequence for bindings that declare none.
    #[serde(default = "default_permissions")]
    pub permissions: Vec<PermissionKind>,
}

/// One entry of `[[bindings]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Stream tag clients address.
    pub stream: String,

    /// Resource identifier sent in notifications. Defaults to the stream.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub page_size: Option<usize>,

    #[serde(default)]
    pub permissions: Option<Vec<PermissionKind>>,

    /// Disable create, update, partial_update and delete.
    #[serde(default)]
    pub read_only: bool,

    /// Record schema.
    #[serde(default)]
    pub fields: Vec<FieldSpec>,

    /// Groups every new connection joins.
    #[serde(default)]
    pub auto_subscribe: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("CONDUIT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("CONDUIT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_reply_buffer() -> usize {
    256
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_permissions() -> Vec<PermissionKind> {
    vec![PermissionKind::AllowAny]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            defaults: DefaultsConfig::default(),
            bindings: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::default(),
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
            reply_buffer: default_reply_buffer(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            permissions: default_permissions(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path is read as TOML. Otherwise the first default path
    /// that exists is layered under `CONDUIT__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let found = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        let mut builder = config::Config::builder();
        if let Some(path) = &found {
            tracing::info!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                config::File::from(path.as_path()).format(config::FileFormat::Toml),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("CONDUIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenvis_conduit_core::FieldKind;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.mode, TransportMode::Axum);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.reply_buffer, 256);
        assert_eq!(config.limits.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.defaults.page_size, 25);
        assert_eq!(config.defaults.permissions, vec![PermissionKind::AllowAny]);
        assert!(config.bindings.is_empty());
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 8080;
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [transport]
            mode = "standalone"

            [limits]
            max_connections = 50000
            handshake_timeout_secs = 3

            [[auth.users]]
            username = "admin"
            password = "secret"
            superuser = true

            [[bindings]]
            stream = "widget"
            model = "inventory.widget"
            page_size = 2
            permissions = ["is_authenticated"]
            auto_subscribe = ["create"]

            [[bindings.fields]]
            name = "name"
            kind = "string"
            max_length = 64

            [[bindings.fields]]
            name = "quantity"
            kind = "integer"
            required = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.transport.mode, TransportMode::Standalone);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.handshake_timeout_secs, 3);
        assert_eq!(config.limits.reply_buffer, 256);
        assert!(config.auth.users[0].superuser);

        let binding = &config.bindings[0];
        assert_eq!(binding.model.as_deref(), Some("inventory.widget"));
        assert_eq!(
            binding.permissions,
            Some(vec![PermissionKind::IsAuthenticated])
        );
        assert_eq!(binding.fields.len(), 2);
        assert_eq!(binding.fields[1].kind, FieldKind::Integer);
        assert!(!binding.fields[1].required);
        assert!(!binding.read_only);
    }

    #[test]
    fn test_user_config_debug_hides_password() {
        let user = UserConfig {
            username: "admin".into(),
            password: "hunter2".into(),
            superuser: false,
        };
        assert!(!format!("{user:?}").contains("hunter2"));
    }
}
