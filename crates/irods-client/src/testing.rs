//! Testing utilities
//!
//! In-memory transports for exercising pools and sessions without an iRODS
//! server. Every connection a [`MockConnectionFactory`] builds is recorded
//! in creation order, and its [`MockConnectionState`] can be inspected or
//! manipulated (severed, made to fail refreshes) from the test.
//!
//! # Example
//!
//! ```rust,ignore
//! use irods_client::testing::*;
//!
//! #[tokio::test]
//! async fn test_refresh_degradation() {
//!     let factory = MockConnectionFactory::new().with_rollback_failure(true);
//!     let session = IrodsSession::new(test_account(), SessionConfig::default(),
//!         Arc::new(factory.clone())).await.unwrap();
//!
//!     assert_eq!(session.refresh_capability(), RefreshCapability::Unsupported);
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::account::Account;
use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Account used throughout the test suites
pub fn test_account() -> Account {
    Account::new("irods.example.org", 1247, "rods", "tempZone", "rods")
}

/// Observable state of one mock connection
#[derive(Debug)]
pub struct MockConnectionState {
    index: usize,
    connected: AtomicBool,
    created_at: Instant,
    last_access: Mutex<Instant>,
    fail_rollback: AtomicBool,
    parallel_upload: bool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    rollback_calls: AtomicUsize,
}

impl MockConnectionState {
    /// Creation order within the factory, starting at 0
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the connection is up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drop the connection as if the network failed
    pub fn sever(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Mark the connection as just used
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Make refresh calls on this connection fail or succeed
    pub fn set_fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }

    /// Number of connect calls
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of disconnect calls
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Number of refresh calls
    pub fn rollback_calls(&self) -> usize {
        self.rollback_calls.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct FactoryShared {
    connections: Mutex<Vec<Arc<MockConnectionState>>>,
    fail_connect: AtomicBool,
    fail_rollback: AtomicBool,
    parallel_upload: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

/// A transport that lives entirely in memory
#[derive(Debug)]
pub struct MockConnection {
    state: Arc<MockConnectionState>,
    factory: Arc<FactoryShared>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn connect(&self) -> Result<()> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.factory.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.factory.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection("mock server refused connection"));
        }

        self.state.connected.store(true, Ordering::SeqCst);
        self.state.touch();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    fn created_at(&self) -> Instant {
        self.state.created_at
    }

    fn last_successful_access(&self) -> Instant {
        *self.state.last_access.lock()
    }

    async fn poor_mans_rollback(&self) -> Result<()> {
        self.state.rollback_calls.fetch_add(1, Ordering::SeqCst);
        if !self.state.is_connected() {
            return Err(Error::connection("mock connection is not connected"));
        }
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(Error::transaction("mock server rejected rollback"));
        }
        self.state.touch();
        Ok(())
    }

    fn supports_parallel_upload(&self) -> bool {
        self.state.parallel_upload
    }
}

/// Factory producing [`MockConnection`]s.
///
/// Clones share state, so a test can keep one clone while the pool owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockConnectionFactory {
    shared: Arc<FactoryShared>,
}

impl MockConnectionFactory {
    /// Create a factory whose connections connect and refresh successfully
    pub fn new() -> Self {
        Self::default()
    }

    /// Make refreshes fail on connections created from now on
    pub fn with_rollback_failure(self, fail: bool) -> Self {
        self.shared.fail_rollback.store(fail, Ordering::SeqCst);
        self
    }

    /// Report parallel upload support from created connections
    pub fn with_parallel_upload(self, supported: bool) -> Self {
        self.shared.parallel_upload.store(supported, Ordering::SeqCst);
        self
    }

    /// Delay every connect call
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.shared.connect_delay.lock() = Some(delay);
        self
    }

    /// Make subsequent connect calls fail or succeed
    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make refreshes fail or succeed on existing and future connections
    pub fn set_fail_rollback(&self, fail: bool) {
        self.shared.fail_rollback.store(fail, Ordering::SeqCst);
        for state in self.shared.connections.lock().iter() {
            state.set_fail_rollback(fail);
        }
    }

    /// Every connection created so far, in creation order
    pub fn connections(&self) -> Vec<Arc<MockConnectionState>> {
        self.shared.connections.lock().clone()
    }

    /// The `index`-th connection created
    pub fn connection(&self, index: usize) -> Option<Arc<MockConnectionState>> {
        self.shared.connections.lock().get(index).cloned()
    }

    /// Number of connections created
    pub fn created_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Number of connections currently up
    pub fn connected_count(&self) -> usize {
        self.shared
            .connections
            .lock()
            .iter()
            .filter(|s| s.is_connected())
            .count()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn new_connection(
        &self,
        _account: &Account,
        _config: &ConnectionConfig,
    ) -> Result<Box<dyn Connection>> {
        let now = Instant::now();
        let mut connections = self.shared.connections.lock();
        let state = Arc::new(MockConnectionState {
            index: connections.len(),
            connected: AtomicBool::new(false),
            created_at: now,
            last_access: Mutex::new(now),
            fail_rollback: AtomicBool::new(self.shared.fail_rollback.load(Ordering::SeqCst)),
            parallel_upload: self.shared.parallel_upload.load(Ordering::SeqCst),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            rollback_calls: AtomicUsize::new(0),
        });
        connections.push(state.clone());

        Ok(Box::new(MockConnection {
            state,
            factory: self.shared.clone(),
        }))
    }
}
