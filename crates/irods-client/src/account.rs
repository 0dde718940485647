//! iRODS account description
//!
//! An [`Account`] names the server to talk to and the identity to talk as.
//! iRODS distinguishes the *proxy* user (who authenticates) from the
//! *client* user (on whose behalf operations run); for ordinary logins the
//! two are the same.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::Result;

/// Default iRODS server port
pub const DEFAULT_PORT: u16 = 1247;

/// User name iRODS reserves for anonymous access
pub const ANONYMOUS_USER: &str = "anonymous";

/// Longest user or zone name the server accepts
const MAX_NAME_LEN: usize = 63;

/// A wrapper around `SecretString` for passwords and tickets.
///
/// Redacted in `Debug`, `Display` and serialized output.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Use sparingly - only when the actual value is needed (e.g., for authentication).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// Whether the secret is the empty string
    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl Default for SensitiveString {
    fn default() -> Self {
        Self::new("")
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Authentication scheme negotiated during the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// iRODS native password authentication
    #[default]
    Native,
    /// PAM password authentication
    Pam,
}

impl AuthScheme {
    /// Parse a scheme name as written in iRODS configuration files
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "native" => Some(Self::Native),
            "pam" | "pam_password" => Some(Self::Pam),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Pam => write!(f, "pam"),
        }
    }
}

/// Connection target and identity for an iRODS server
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Account {
    /// Server host name or address
    #[validate(length(min = 1, max = 255))]
    pub host: String,
    /// Server port
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    /// User operations run as
    #[validate(custom(function = "validate_user_name"))]
    pub client_user: String,
    /// Zone of the client user
    #[validate(custom(function = "validate_zone_name"))]
    pub client_zone: String,
    /// User that authenticates
    #[validate(custom(function = "validate_user_name"))]
    pub proxy_user: String,
    /// Zone of the proxy user
    #[validate(custom(function = "validate_zone_name"))]
    pub proxy_zone: String,
    /// Password of the proxy user
    #[serde(default)]
    pub password: SensitiveString,
    /// Authentication scheme
    #[serde(default)]
    pub auth_scheme: AuthScheme,
    /// Resource used when a request names none
    #[serde(default)]
    pub default_resource: Option<String>,
    /// Access ticket, if any
    #[serde(default)]
    pub ticket: Option<SensitiveString>,
}

impl Account {
    /// Create a native account where proxy and client identity coincide
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        zone: impl Into<String>,
        password: impl Into<SensitiveString>,
    ) -> Self {
        let user = user.into();
        let zone = zone.into();
        Self {
            host: host.into(),
            port,
            client_user: user.clone(),
            client_zone: zone.clone(),
            proxy_user: user,
            proxy_zone: zone,
            password: password.into(),
            auth_scheme: AuthScheme::Native,
            default_resource: None,
            ticket: None,
        }
    }

    /// Create an account that authenticates as `proxy_user` and acts as `client_user`
    pub fn proxy(
        host: impl Into<String>,
        port: u16,
        client_user: impl Into<String>,
        client_zone: impl Into<String>,
        proxy_user: impl Into<String>,
        proxy_zone: impl Into<String>,
        password: impl Into<SensitiveString>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            client_user: client_user.into(),
            client_zone: client_zone.into(),
            proxy_user: proxy_user.into(),
            proxy_zone: proxy_zone.into(),
            password: password.into(),
            auth_scheme: AuthScheme::Native,
            default_resource: None,
            ticket: None,
        }
    }

    /// Create an anonymous account for `zone`
    pub fn anonymous(host: impl Into<String>, port: u16, zone: impl Into<String>) -> Self {
        Self::new(host, port, ANONYMOUS_USER, zone, "")
    }

    /// Set the authentication scheme
    pub fn with_auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.auth_scheme = scheme;
        self
    }

    /// Set the default resource
    pub fn with_default_resource(mut self, resource: impl Into<String>) -> Self {
        self.default_resource = Some(resource.into());
        self
    }

    /// Set an access ticket
    pub fn with_ticket(mut self, ticket: impl Into<SensitiveString>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }

    /// Whether the client user is the anonymous user
    pub fn is_anonymous(&self) -> bool {
        self.client_user == ANONYMOUS_USER
    }

    /// Whether the authenticating identity differs from the acting one
    pub fn uses_proxy_access(&self) -> bool {
        self.proxy_user != self.client_user || self.proxy_zone != self.client_zone
    }

    /// `host:port` of the server
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the account is usable for connecting
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)?;
        Ok(())
    }
}

fn validate_user_name(name: &str) -> std::result::Result<(), ValidationError> {
    validate_name(name, "invalid_user_name")
}

fn validate_zone_name(name: &str) -> std::result::Result<(), ValidationError> {
    if name.contains('/') {
        return Err(ValidationError::new("invalid_zone_name")
            .with_message("zone name must not contain '/'".into()));
    }
    validate_name(name, "invalid_zone_name")
}

fn validate_name(name: &str, code: &'static str) -> std::result::Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ValidationError::new(code)
            .with_message(format!("must be 1-{} characters", MAX_NAME_LEN).into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
    {
        return Err(ValidationError::new(code)
            .with_message("allowed characters are letters, digits and . _ - @".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_mirrors_identity() {
        let account = Account::new("irods.example.org", 1247, "alice", "tempZone", "secret");

        assert_eq!(account.proxy_user, "alice");
        assert_eq!(account.client_zone, "tempZone");
        assert!(!account.uses_proxy_access());
        assert!(!account.is_anonymous());
        assert_eq!(account.address(), "irods.example.org:1247");
        assert!(account.validate().is_ok());
    }

    #[test]
    fn test_anonymous_account() {
        let account = Account::anonymous("irods.example.org", DEFAULT_PORT, "tempZone");
        assert!(account.is_anonymous());
        assert!(account.password.is_empty());
        assert!(account.validate().is_ok());
    }

    #[test]
    fn test_password_redacted() {
        let account = Account::new("localhost", 1247, "rods", "tempZone", "rods-password");
        let debug = format!("{:?}", account);
        assert!(!debug.contains("rods-password"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(account.password.expose_secret(), "rods-password");
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        let account = Account::new("localhost", 1247, "bad user", "tempZone", "x");
        assert!(account.validate().is_err());

        let account = Account::new("localhost", 1247, "rods", "temp/Zone", "x");
        assert!(account.validate().is_err());

        let account = Account::new("", 1247, "rods", "tempZone", "x");
        assert!(account.validate().is_err());

        let account = Account::new("localhost", 0, "rods", "tempZone", "x");
        assert!(account.validate().is_err());
    }

    #[test]
    fn test_auth_scheme_parse() {
        assert_eq!(AuthScheme::parse("native"), Some(AuthScheme::Native));
        assert_eq!(AuthScheme::parse("PAM"), Some(AuthScheme::Pam));
        assert_eq!(AuthScheme::parse("pam_password"), Some(AuthScheme::Pam));
        assert_eq!(AuthScheme::parse("gsi"), None);
    }
}
