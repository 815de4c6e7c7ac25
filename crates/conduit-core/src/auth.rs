//! Connection authentication.
//!
//! Credentials are taken from the connect handshake, either from inline
//! fields supplied by the transport or from the request query string. A
//! connection without valid credentials stays anonymous; it is never rejected.

use async_trait::async_trait;
use conduit_protocol::WireFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User key.
    pub id: u64,
    /// Login name.
    pub username: String,
    /// Elevated privileges flag.
    #[serde(default)]
    pub is_superuser: bool,
}

/// The identity a connection acts as.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Identity {
    /// No credentials, or credentials that failed to authenticate.
    #[default]
    Anonymous,
    /// A successfully authenticated user.
    Authenticated(User),
}

impl Identity {
    /// Check if this is a non-anonymous identity.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::Authenticated(_))
    }

    /// Check if this identity has elevated privileges.
    #[must_use]
    pub fn is_superuser(&self) -> bool {
        matches!(self, Identity::Authenticated(user) if user.is_superuser)
    }

    /// The authenticated user, if any.
    #[must_use]
    pub fn user(&self) -> Option<&User> {
        match self {
            Identity::Anonymous => None,
            Identity::Authenticated(user) => Some(user),
        }
    }

    /// The username, if authenticated.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.user().map(|u| u.username.as_str())
    }
}

/// Metadata captured from the transport when a connection opens.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Request path.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query_string: Option<String>,
    /// Request headers; names are compared case-insensitively.
    pub headers: Vec<(String, String)>,
    /// Inline fields supplied directly by the transport.
    pub fields: HashMap<String, String>,
}

impl Handshake {
    /// Create a handshake for a request path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the query string.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query_string = Some(query.trim_start_matches('?').to_string());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add an inline field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Decoded query parameters. The first occurrence of a repeated name wins.
    #[must_use]
    pub fn query_params(&self) -> HashMap<String, String> {
        let Some(query) = self.query_string.as_deref() else {
            return HashMap::new();
        };

        let pairs: Vec<(String, String)> = match serde_urlencoded::from_str(query) {
            Ok(pairs) => pairs,
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable query string");
                return HashMap::new();
            }
        };

        let mut params = HashMap::with_capacity(pairs.len());
        for (name, value) in pairs {
            params.entry(name).or_insert(value);
        }
        params
    }

    /// Look up one query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params().remove(name)
    }

    /// Look up a header by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Outbound wire format requested with `?format=`, JSON by default.
    #[must_use]
    pub fn wire_format(&self) -> WireFormat {
        self.query_param("format")
            .and_then(|f| f.parse().ok())
            .unwrap_or_default()
    }
}

/// Username and password presented at connect.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password, if one was supplied.
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl Credentials {
    /// Extract credentials from a handshake.
    ///
    /// Inline fields take precedence over the query string. Returns `None`
    /// when no username is present.
    #[must_use]
    pub fn from_handshake(handshake: &Handshake) -> Option<Self> {
        if let Some(username) = handshake.fields.get("username") {
            return Some(Self {
                username: username.clone(),
                password: handshake.fields.get("password").cloned(),
            });
        }

        let mut params = handshake.query_params();
        let username = params.remove("username")?;
        Some(Self {
            username,
            password: params.remove("password"),
        })
    }
}

/// Resolves credentials to a user.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate credentials, returning the user on success.
    async fn authenticate(&self, credentials: &Credentials) -> Option<User>;
}

/// Authenticator that rejects everyone. Every connection is anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthentication;

#[async_trait]
impl Authenticator for NoAuthentication {
    async fn authenticate(&self, _credentials: &Credentials) -> Option<User> {
        None
    }
}

/// Authenticator backed by a fixed username/password table.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    users: HashMap<String, (String, User)>,
}

impl StaticAuthenticator {
    /// Create an empty authenticator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user. User ids are assigned in insertion order starting at 1.
    #[must_use]
    pub fn with_user(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        is_superuser: bool,
    ) -> Self {
        let username = username.into();
        let id = match self.users.get(&username) {
            Some((_, existing)) => existing.id,
            None => self.users.len() as u64 + 1,
        };
        let user = User {
            id,
            username: username.clone(),
            is_superuser,
        };
        self.users.insert(username, (password.into(), user));
        self
    }

    /// Number of known users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check if no users are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Option<User> {
        let (password, user) = self.users.get(&credentials.username)?;
        if credentials.password.as_deref() == Some(password.as_str()) {
            debug!(username = %user.username, "Authenticated");
            Some(user.clone())
        } else {
            debug!(username = %credentials.username, "Authentication failed");
            None
        }
    }
}
