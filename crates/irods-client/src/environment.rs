//! Loader for the iRODS client environment file
//!
//! iCommands keep connection settings in `~/.irods/irods_environment.json`.
//! Only the keys needed to build an [`Account`] are read; unknown keys are
//! ignored.

use serde::Deserialize;
use std::path::Path;

use crate::account::{Account, AuthScheme, SensitiveString, DEFAULT_PORT};
use crate::error::{Error, Result};

/// Subset of `irods_environment.json`
#[derive(Debug, Clone, Deserialize)]
pub struct IrodsEnvironment {
    /// Server host
    pub irods_host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub irods_port: u16,
    /// User name
    pub irods_user_name: String,
    /// Zone name
    pub irods_zone_name: String,
    /// Authentication scheme name
    #[serde(default)]
    pub irods_authentication_scheme: Option<String>,
    /// Default resource
    #[serde(default)]
    pub irods_default_resource: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl IrodsEnvironment {
    /// Parse environment JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid irods environment: {}", e)))
    }

    /// Read and parse an environment file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "failed to read irods environment {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Authentication scheme, `native` when unset
    pub fn auth_scheme(&self) -> Result<AuthScheme> {
        match &self.irods_authentication_scheme {
            None => Ok(AuthScheme::Native),
            Some(name) => AuthScheme::parse(name).ok_or_else(|| {
                Error::config(format!("unsupported authentication scheme: {}", name))
            }),
        }
    }

    /// Build a validated account using `password`
    pub fn into_account(self, password: impl Into<SensitiveString>) -> Result<Account> {
        let scheme = self.auth_scheme()?;
        let mut account = Account::new(
            self.irods_host,
            self.irods_port,
            self.irods_user_name,
            self.irods_zone_name,
            password,
        )
        .with_auth_scheme(scheme);
        account.default_resource = self.irods_default_resource;
        account.validate()?;
        Ok(account)
    }
}
