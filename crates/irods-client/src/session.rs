//! iRODS session: connection allocation policy on top of the pool
//!
//! [`IrodsSession`] hands out connections from one [`ConnectionPool`] and
//! adds two behaviours:
//!
//! - **Sharing under pressure.** When the pool is full, the session shares
//!   the connection with the fewest borrowers instead of failing or
//!   blocking. Borrowers of a shared connection coordinate among themselves.
//! - **Transaction refresh.** Each server connection holds an implicit
//!   database snapshot. Before a reused pooled connection is handed out,
//!   the session aborts and restarts that transaction ("poor man's
//!   rollback") so the borrower sees writes made through sibling
//!   connections. If the refresh ever fails, the session stops trying and
//!   uses freshly opened connections for the rest of its life.
//!
//! ```text
//!            get() ok, reused            refresh ok
//!  Supported ───────────────► refresh ──────────────► hand out
//!      │                         │ refresh failed
//!      │                         ▼
//!      │                    Unsupported (sticky) ──► discard + get_new()
//! ```

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::config::SessionConfig;
use crate::connection::{ConnectionFactory, ConnectionHandle, ConnectionId};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;

/// Whether the server honours the transaction refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RefreshCapability {
    /// Not checked yet; refresh is disabled for this session
    #[default]
    NotChecked,
    /// Refresh check succeeded; reused connections are refreshed
    Supported,
    /// A refresh failed; reused connections are replaced with fresh ones
    Unsupported,
}

struct SharedEntry {
    conn: ConnectionHandle,
    count: usize,
}

#[derive(Default)]
struct SessionState {
    shared: HashMap<ConnectionId, SharedEntry>,
    refresh: RefreshCapability,
    released: bool,
}

/// What to do with a connection whose borrow just ended
enum Disposal {
    /// Other borrowers remain
    Keep,
    ToPool,
    Discard,
    /// Not tracked by the session
    Unmanaged,
}

/// Fewest borrowers first, then oldest, then lowest id
fn share_order(a: &SharedEntry, b: &SharedEntry) -> Ordering {
    a.count
        .cmp(&b.count)
        .then_with(|| a.conn.created_at().cmp(&b.conn.created_at()))
        .then_with(|| a.conn.id().cmp(&b.conn.id()))
}

/// Connection session for one iRODS account.
///
/// Acquires, returns and discards are serialised by an allocation lock, so
/// a connection is always in the share table while the pool counts it as
/// occupied by this session. Without that, a concurrent acquire could find
/// the pool full and nothing to share while another borrower is still
/// connecting.
pub struct IrodsSession {
    account: Account,
    config: SessionConfig,
    pool: ConnectionPool,
    start_new_transaction: bool,
    supports_parallel_upload: bool,
    allocation: tokio::sync::Mutex<()>,
    state: Mutex<SessionState>,
}

impl IrodsSession {
    /// Create a session and its pool.
    ///
    /// Checks one connection for transaction refresh support (skipped for
    /// anonymous accounts or when disabled in `config`) and for parallel
    /// upload support. A failed refresh check degrades the session; it does
    /// not fail creation.
    pub async fn new(
        account: Account,
        mut config: SessionConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        config.fill_defaults();
        let pool = ConnectionPool::new(account.clone(), config.pool.clone(), factory).await?;

        let start_new_transaction = config.start_new_transaction && !account.is_anonymous();
        let (refresh, supports_parallel_upload) =
            match Self::detect_capabilities(&pool, start_new_transaction).await {
                Ok(detected) => detected,
                Err(e) => {
                    pool.release().await;
                    return Err(e);
                }
            };

        info!(
            "Session for {}@{} on {} ready (transaction refresh: {:?}, parallel upload: {})",
            account.client_user,
            account.client_zone,
            account.address(),
            refresh,
            supports_parallel_upload
        );

        Ok(Self {
            account,
            config,
            pool,
            start_new_transaction,
            supports_parallel_upload,
            allocation: tokio::sync::Mutex::new(()),
            state: Mutex::new(SessionState {
                refresh,
                ..Default::default()
            }),
        })
    }

    async fn detect_capabilities(
        pool: &ConnectionPool,
        start_new_transaction: bool,
    ) -> Result<(RefreshCapability, bool)> {
        let (conn, _) = pool.get().await?;

        let mut refresh = RefreshCapability::NotChecked;
        if start_new_transaction {
            let outcome = {
                let _guard = conn.lock().await;
                conn.poor_mans_rollback().await
            };
            refresh = match outcome {
                Ok(()) => RefreshCapability::Supported,
                Err(e) => {
                    warn!(
                        connection_id = %conn.id(),
                        "Transaction refresh is not supported, reused connections will be replaced: {}",
                        e
                    );
                    pool.metrics().record_refresh_failure();
                    RefreshCapability::Unsupported
                }
            };
        }
        let supports_parallel_upload = conn.supports_parallel_upload();

        if refresh == RefreshCapability::Unsupported {
            pool.discard(&conn).await;
        } else {
            pool.return_connection(&conn).await?;
        }
        Ok((refresh, supports_parallel_upload))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state.lock().released {
            return Err(Error::Released);
        }
        Ok(())
    }

    /// Take a connection from the pool and apply the refresh policy
    async fn checkout(&self) -> Result<ConnectionHandle> {
        let (conn, is_new) = self.pool.get().await?;
        if !self.start_new_transaction || is_new {
            return Ok(conn);
        }

        let capability = self.state.lock().refresh;
        if capability == RefreshCapability::Unsupported {
            self.pool.discard(&conn).await;
            return self.pool.get_new().await;
        }

        let outcome = {
            let _guard = conn.lock().await;
            conn.poor_mans_rollback().await
        };
        match outcome {
            Ok(()) => Ok(conn),
            Err(e) => {
                warn!(
                    connection_id = %conn.id(),
                    "Transaction refresh failed, switching to fresh connections: {}",
                    e
                );
                self.state.lock().refresh = RefreshCapability::Unsupported;
                self.metrics().record_refresh_failure();
                self.metrics().record_pool_failure();
                self.pool.discard(&conn).await;
                self.pool.get_new().await
            }
        }
    }

    fn track(&self, conn: &ConnectionHandle) {
        let mut state = self.state.lock();
        let entry = state
            .shared
            .entry(conn.id())
            .or_insert_with(|| SharedEntry {
                conn: conn.clone(),
                count: 0,
            });
        entry.count += 1;
    }

    fn share_least_used(&self) -> Option<ConnectionHandle> {
        let mut state = self.state.lock();
        let entry = state.shared.values_mut().min_by(|a, b| share_order(a, b))?;
        entry.count += 1;
        debug!(
            connection_id = %entry.conn.id(),
            share_count = entry.count,
            "Pool full, sharing connection"
        );
        Some(entry.conn.clone())
    }

    /// Acquire a connection.
    ///
    /// Prefers an exclusive connection from the pool. When the pool is
    /// full, shares the connection with the fewest borrowers. Fails with
    /// [`Error::Exhausted`] only when there is nothing to share.
    pub async fn acquire_connection(&self) -> Result<ConnectionHandle> {
        self.ensure_active()?;
        let _allocation = self.allocation.lock().await;

        match self.checkout().await {
            Ok(conn) => {
                self.track(&conn);
                debug!(connection_id = %conn.id(), "Acquired connection");
                Ok(conn)
            }
            Err(e) if e.is_pool_full() => {
                self.metrics().record_pool_failure();
                self.share_least_used().ok_or_else(|| {
                    Error::exhausted(format!(
                        "pool is full ({} connections) and no connection can be shared",
                        self.pool.max_connections()
                    ))
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Acquire `count` connections.
    ///
    /// Takes as many exclusive connections as the pool allows, then fills
    /// the rest by sharing tracked connections round-robin, least shared
    /// first. Returned handles may repeat.
    pub async fn acquire_connections_multi(&self, count: usize) -> Result<Vec<ConnectionHandle>> {
        self.ensure_active()?;
        let _allocation = self.allocation.lock().await;

        let mut acquired = Vec::with_capacity(count);
        while acquired.len() < count {
            match self.checkout().await {
                Ok(conn) => {
                    self.track(&conn);
                    acquired.push(conn);
                }
                Err(e) if e.is_pool_full() => break,
                Err(e) => {
                    for conn in &acquired {
                        let disposal = self.end_borrow(conn, false);
                        if let Err(undo) = self.dispose(conn, disposal).await {
                            warn!(
                                connection_id = %conn.id(),
                                "Failed to give back batch connection: {}",
                                undo
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        if acquired.len() < count {
            self.metrics().record_pool_failure();

            let mut state = self.state.lock();
            let mut candidates: Vec<&mut SharedEntry> = state.shared.values_mut().collect();
            if candidates.is_empty() {
                return Err(Error::exhausted(format!(
                    "pool is full ({} connections) and no connection can be shared",
                    self.pool.max_connections()
                )));
            }
            candidates.sort_by(|a, b| share_order(a, b));

            let missing = count - acquired.len();
            let len = candidates.len();
            for i in 0..missing {
                let entry = &mut candidates[i % len];
                entry.count += 1;
                acquired.push(entry.conn.clone());
            }
            debug!(
                shared = missing,
                across = len,
                "Pool full, shared connections to satisfy batch"
            );
        }

        Ok(acquired)
    }

    /// Open a connection outside the pool.
    ///
    /// The session does not track it; the caller disconnects it, or passes
    /// it to [`return_connection`](Self::return_connection), which
    /// disconnects untracked connections.
    pub async fn acquire_unmanaged_connection(&self) -> Result<ConnectionHandle> {
        self.ensure_active()?;
        let conn = self.pool.open_unmanaged().await?;
        debug!(connection_id = %conn.id(), "Opened unmanaged connection");
        Ok(conn)
    }

    fn end_borrow(&self, conn: &ConnectionHandle, discard: bool) -> Disposal {
        let mut state = self.state.lock();
        let Some(entry) = state.shared.get_mut(&conn.id()) else {
            return Disposal::Unmanaged;
        };

        entry.count -= 1;
        if entry.count > 0 {
            return Disposal::Keep;
        }

        state.shared.remove(&conn.id());
        if discard || state.refresh == RefreshCapability::Unsupported {
            Disposal::Discard
        } else {
            Disposal::ToPool
        }
    }

    async fn dispose(&self, conn: &ConnectionHandle, disposal: Disposal) -> Result<()> {
        match disposal {
            Disposal::Keep => Ok(()),
            Disposal::ToPool => self.pool.return_connection(conn).await,
            Disposal::Discard => {
                self.pool.discard(conn).await;
                Ok(())
            }
            Disposal::Unmanaged => {
                if conn.is_connected() {
                    conn.close(self.metrics()).await;
                }
                Ok(())
            }
        }
    }

    /// End one borrow of `conn`.
    ///
    /// The last borrower's return hands the connection back to the pool, or
    /// discards it when transaction refresh is unsupported. Untracked
    /// (unmanaged) connections are disconnected.
    pub async fn return_connection(&self, conn: &ConnectionHandle) -> Result<()> {
        let _allocation = self.allocation.lock().await;
        let disposal = self.end_borrow(conn, false);
        self.dispose(conn, disposal).await
    }

    /// End one borrow of `conn`; the last borrower's call disconnects it
    pub async fn discard_connection(&self, conn: &ConnectionHandle) -> Result<()> {
        let _allocation = self.allocation.lock().await;
        let disposal = self.end_borrow(conn, true);
        self.dispose(conn, disposal).await
    }

    /// Forget all borrows and release the pool. Idempotent.
    pub async fn release(&self) {
        let _allocation = self.allocation.lock().await;
        {
            let mut state = self.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            state.shared.clear();
        }

        self.pool.release().await;
        info!(
            "Session for {}@{} released",
            self.account.client_user, self.account.client_zone
        );
    }

    /// Open connections in the pool (occupied plus idle)
    pub fn connection_total(&self) -> usize {
        self.pool.open_connections()
    }

    /// Connections checked out of the pool
    pub fn occupied_connections(&self) -> usize {
        self.pool.occupied_connections()
    }

    /// Idle connections in the pool
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_connections()
    }

    /// Pool capacity
    pub fn max_connections(&self) -> usize {
        self.pool.max_connections()
    }

    /// Current borrowers of `conn`, zero if untracked
    pub fn share_count(&self, conn: &ConnectionHandle) -> usize {
        self.state
            .lock()
            .shared
            .get(&conn.id())
            .map_or(0, |entry| entry.count)
    }

    /// Number of distinct connections currently borrowed through the session
    pub fn shared_connections(&self) -> usize {
        self.state.lock().shared.len()
    }

    /// Whether the server accepts parallel uploads
    pub fn supports_parallel_upload(&self) -> bool {
        self.supports_parallel_upload
    }

    /// Transaction refresh state
    pub fn refresh_capability(&self) -> RefreshCapability {
        self.state.lock().refresh
    }

    /// Whether reused connections get a transaction refresh
    pub fn starts_new_transactions(&self) -> bool {
        self.start_new_transaction
    }

    /// Account of this session
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Effective configuration (defaults filled)
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Metrics sink
    pub fn metrics(&self) -> &Arc<Metrics> {
        self.pool.metrics()
    }

    /// Underlying pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl std::fmt::Debug for IrodsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IrodsSession")
            .field("account", &self.account.address())
            .field("shared", &state.shared.len())
            .field("refresh", &state.refresh)
            .field("released", &state.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionPoolConfig;
    use crate::testing::{test_account, MockConnectionFactory};

    fn config(max_cap: usize) -> SessionConfig {
        SessionConfig::new(ConnectionPoolConfig::new().with_max_cap(max_cap))
    }

    #[tokio::test]
    async fn test_refresh_support_detected_at_creation() {
        let factory = MockConnectionFactory::new().with_parallel_upload(true);
        let session = IrodsSession::new(test_account(), config(3), Arc::new(factory.clone()))
            .await
            .unwrap();

        assert_eq!(session.refresh_capability(), RefreshCapability::Supported);
        assert!(session.supports_parallel_upload());
        assert_eq!(factory.connection(0).unwrap().rollback_calls(), 1);
        assert_eq!(session.idle_connections(), 1);

        session.release().await;
    }

    #[tokio::test]
    async fn test_anonymous_session_skips_refresh() {
        let factory = MockConnectionFactory::new();
        let account = Account::anonymous("irods.example.org", 1247, "tempZone");
        let session = IrodsSession::new(account, config(3), Arc::new(factory.clone()))
            .await
            .unwrap();

        assert!(!session.starts_new_transactions());
        assert_eq!(session.refresh_capability(), RefreshCapability::NotChecked);

        let conn = session.acquire_connection().await.unwrap();
        session.return_connection(&conn).await.unwrap();
        assert_eq!(factory.connection(0).unwrap().rollback_calls(), 0);

        session.release().await;
    }

    #[test]
    fn test_share_order_prefers_fewest_borrowers() {
        let factory = MockConnectionFactory::new();
        let account = test_account();
        let conn_config = crate::connection::ConnectionConfig::default();
        let a = ConnectionHandle::new(factory.new_connection(&account, &conn_config).unwrap());
        let b = ConnectionHandle::new(factory.new_connection(&account, &conn_config).unwrap());

        let busy = SharedEntry { conn: a.clone(), count: 3 };
        let quiet = SharedEntry { conn: b.clone(), count: 1 };
        assert_eq!(share_order(&quiet, &busy), Ordering::Less);

        let first = SharedEntry { conn: a, count: 1 };
        let second = SharedEntry { conn: b, count: 1 };
        assert_eq!(share_order(&first, &second), Ordering::Less);
    }
}
