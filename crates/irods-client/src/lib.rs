//! # irods-client
//!
//! Connection pooling and session management for iRODS clients.
//!
//! The crate manages a bounded set of authenticated connections to an iRODS
//! server and hands them out safely to concurrent callers. The wire protocol
//! itself lives behind the [`Connection`] trait; this crate decides which
//! connection a caller gets, keeps reused connections transactionally fresh,
//! and reclaims idle or expired ones.
//!
//! ## Features
//!
//! - **Bounded pool**: LIFO reuse, oldest-first idle eviction, lifespan retirement
//! - **Background reaper**: idle-timeout and lifespan eviction on a fixed interval
//! - **Never blocks**: a full pool is an immediate [`Error::PoolFull`]
//! - **Sharing under pressure**: sessions share the least-used connection instead of failing
//! - **Transaction refresh**: reused connections see a fresh server snapshot
//! - **Metrics**: atomic counters mirrored to the `metrics` facade
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use irods_client::prelude::*;
//!
//! let account = Account::new("irods.example.org", 1247, "alice", "tempZone", "secret");
//! let config = SessionConfig::new(ConnectionPoolConfig::new().with_max_cap(10));
//! let session = IrodsSession::new(account, config, Arc::new(MyTransportFactory)).await?;
//!
//! let conn = session.acquire_connection().await?;
//! // ... issue requests over conn ...
//! session.return_connection(&conn).await?;
//!
//! session.release().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod account;
pub mod config;
pub mod connection;
pub mod environment;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Account and environment
    pub use crate::account::{Account, AuthScheme, SensitiveString};
    pub use crate::environment::IrodsEnvironment;

    // Connection traits and config
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, ConnectionHandle, ConnectionId,
    };

    // Pool and session
    pub use crate::config::{ConnectionPoolConfig, SessionConfig};
    pub use crate::metrics::{Metrics, MetricsSnapshot};
    pub use crate::pool::ConnectionPool;
    pub use crate::session::{IrodsSession, RefreshCapability};
}

// Re-export commonly used items at crate root
pub use account::Account;
pub use connection::{Connection, ConnectionFactory, ConnectionHandle};
pub use error::{Error, Result};
pub use session::IrodsSession;
