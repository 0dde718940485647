//! Connection traits for irods-client
//!
//! The pool and session never speak the iRODS wire protocol themselves.
//! They manage transports behind two seams:
//! - [`Connection`]: one authenticated transport with lifecycle timestamps
//!   and the transaction refresh ("poor man's rollback") operation
//! - [`ConnectionFactory`]: builds unconnected transports for an account
//!
//! [`ConnectionHandle`] wraps a transport with a process-unique identity and
//! the per-connection lock the session holds while refreshing.

use async_trait::async_trait;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::account::Account;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// A single transport to an iRODS server.
///
/// Implementations use interior mutability: a connection is shared between
/// the pool, the session and borrowers through [`ConnectionHandle`].
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establish the network session and authenticate
    async fn connect(&self) -> Result<()>;

    /// Tear down the network session. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the network session is up
    fn is_connected(&self) -> bool;

    /// When this connection was constructed
    fn created_at(&self) -> Instant;

    /// When a request last completed successfully
    fn last_successful_access(&self) -> Instant;

    /// Abort and restart the server-side transaction so that subsequent
    /// reads see a fresh snapshot. No data is rolled back.
    async fn poor_mans_rollback(&self) -> Result<()>;

    /// Whether the server accepts parallel uploads
    fn supports_parallel_upload(&self) -> bool;

    /// Time since creation
    fn age(&self) -> Duration {
        self.created_at().elapsed()
    }

    /// Time since last successful access
    fn idle_time(&self) -> Duration {
        self.last_successful_access().elapsed()
    }
}

/// Factory for creating connections
pub trait ConnectionFactory: Send + Sync {
    /// Construct a transport for `account`. The result is not yet connected.
    fn new_connection(
        &self,
        account: &Account,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn Connection>>;
}

/// Transport-level settings handed to the factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Application name reported to the server
    pub application_name: String,
    /// Upper bound on establishing a connection
    pub connect_timeout: Duration,
    /// Upper bound on a single request/response exchange
    pub operation_timeout: Duration,
    /// Socket send/receive buffer size in bytes
    pub tcp_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            application_name: crate::config::DEFAULT_APPLICATION_NAME.to_string(),
            connect_timeout: crate::config::DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: crate::config::DEFAULT_OPERATION_TIMEOUT,
            tcp_buffer_size: crate::config::DEFAULT_TCP_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Create configuration with an application name
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Default::default()
        }
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set TCP buffer size
    pub fn with_tcp_buffer_size(mut self, size: usize) -> Self {
        self.tcp_buffer_size = size;
        self
    }
}

/// Process-unique identity of a [`ConnectionHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct HandleInner {
    id: ConnectionId,
    conn: Box<dyn Connection>,
    lock: Mutex<()>,
}

/// Shared handle to a connection.
///
/// Clones refer to the same transport; equality and hashing use the
/// handle's [`ConnectionId`].
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Wrap a transport, assigning it a fresh identity
    pub fn new(conn: Box<dyn Connection>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: ConnectionId::next(),
                conn,
                lock: Mutex::new(()),
            }),
        }
    }

    /// Identity of this connection
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Acquire the connection-level lock.
    ///
    /// Serialises work that must not interleave on one transport, such as
    /// the transaction refresh. Independent of pool and session locks.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock.lock().await
    }

    /// The wrapped transport
    pub fn connection(&self) -> &dyn Connection {
        self.inner.conn.as_ref()
    }

    /// Whether `now` is past either the idle deadline or the lifespan deadline
    pub(crate) fn is_expired(&self, now: Instant, idle_timeout: Duration, lifespan: Duration) -> bool {
        now > self.last_successful_access() + idle_timeout || now > self.created_at() + lifespan
    }

    /// Disconnect, logging rather than propagating transport errors
    pub(crate) async fn close(&self, metrics: &Metrics) {
        if let Err(e) = self.disconnect().await {
            warn!(connection_id = %self.id(), "Error while disconnecting: {}", e);
        }
        metrics.decrease_connections_opened();
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.inner.conn.as_ref()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("connected", &self.inner.conn.is_connected())
            .finish()
    }
}

/// Construct and connect a transport, bounded by the connect timeout.
///
/// Successful connections are counted as opened; failures as connection
/// failures. A transport that fails to connect is disconnected before the
/// error is returned.
pub(crate) async fn establish(
    factory: &dyn ConnectionFactory,
    account: &Account,
    config: &ConnectionConfig,
    metrics: &Metrics,
) -> Result<ConnectionHandle> {
    let conn = factory.new_connection(account, config)?;

    let outcome = tokio::time::timeout(config.connect_timeout, conn.connect()).await;
    let result = match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(match e {
            Error::Connection { .. } | Error::Timeout { .. } => e,
            other => Error::connection_with_source(
                format!("failed to connect to {}", account.address()),
                other,
            ),
        }),
        Err(_) => Err(Error::timeout(format!(
            "connecting to {} took longer than {}ms",
            account.address(),
            config.connect_timeout.as_millis()
        ))),
    };

    if let Err(e) = result {
        metrics.record_connection_failure();
        let _ = conn.disconnect().await;
        warn!("Failed to connect to {}: {}", account.address(), e);
        return Err(e);
    }

    let handle = ConnectionHandle::new(conn);
    metrics.increase_connections_opened();
    debug!(connection_id = %handle.id(), "Connected to {}", account.address());
    Ok(handle)
}
