//! Error types for irods-client
//!
//! Errors are classified so callers can tell ordinary contention from
//! systemic failure:
//! - Retriable errors (connection, timeout, pool full)
//! - Non-retriable errors (configuration, misuse, released resources)
//!
//! `PoolFull` is a control-flow signal as much as an error: the session
//! checks for it with [`Error::is_pool_full`] and falls back to sharing.

use std::fmt;
use thiserror::Error;

use crate::connection::ConnectionId;

/// Result type for irods-client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection establishment or transport failure (retriable)
    Connection,
    /// Timeout while connecting (retriable)
    Timeout,
    /// Invalid account or configuration
    Configuration,
    /// Pool at capacity (retriable, or share instead)
    PoolFull,
    /// Session has nothing left to hand out
    Exhausted,
    /// Transaction refresh failure
    Transaction,
    /// Caller misuse of the pool contract
    Misuse,
    /// Pool or session already released
    Released,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::PoolFull)
    }
}

/// Main error type for irods-client
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connect attempt exceeded the configured timeout
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Invalid account or configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Every connection slot is occupied
    #[error("connection pool is full: {message}")]
    PoolFull { message: String },

    /// Returned connection is not checked out from this pool
    #[error("connection {id} is not occupied by this pool")]
    NotOccupied { id: ConnectionId },

    /// No connection can be created or shared
    #[error("connections exhausted: {message}")]
    Exhausted { message: String },

    /// Transaction refresh failed on a connection
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Pool or session has been released
    #[error("connection pool has been released")]
    Released,
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolFull { .. } => ErrorCategory::PoolFull,
            Self::NotOccupied { .. } => ErrorCategory::Misuse,
            Self::Exhausted { .. } => ErrorCategory::Exhausted,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Released => ErrorCategory::Released,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether this error signals a full pool
    #[inline]
    pub fn is_pool_full(&self) -> bool {
        matches!(self, Self::PoolFull { .. })
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool-full error
    pub fn pool_full(message: impl Into<String>) -> Self {
        Self::PoolFull {
            message: message.into(),
        }
    }

    /// Create an exhaustion error
    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::Exhausted {
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::config(errors.to_string())
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::PoolFull => write!(f, "pool_full"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Transaction => write!(f, "transaction"),
            Self::Misuse => write!(f, "misuse"),
            Self::Released => write!(f, "released"),
        }
    }
}
