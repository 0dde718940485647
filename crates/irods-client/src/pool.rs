//! Connection pool for irods-client
//!
//! A bounded set of connections split into *idle* (available) and
//! *occupied* (checked out):
//! - Non-blocking: exhaustion is reported immediately as [`Error::PoolFull`]
//! - LIFO reuse: the most recently returned connection is handed out first
//! - Oldest-first eviction when the idle list exceeds `max_idle`
//! - Retirement of connections older than `lifespan` on return
//! - A background reaper that evicts idle connections past `idle_timeout`
//!   or `lifespan`
//!
//! # Example
//!
//! ```rust,ignore
//! use irods_client::prelude::*;
//!
//! let pool = ConnectionPool::new(account, ConnectionPoolConfig::new().with_max_cap(10), factory).await?;
//!
//! let (conn, is_new) = pool.get().await?;
//! // ... use conn ...
//! pool.return_connection(&conn).await?;
//!
//! pool.release().await;
//! ```

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::account::Account;
use crate::config::ConnectionPoolConfig;
use crate::connection::{
    establish, ConnectionConfig, ConnectionFactory, ConnectionHandle, ConnectionId,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Bookkeeping guarded by the pool lock
#[derive(Default)]
struct PoolState {
    /// Front is the oldest insertion, back the newest
    idle: VecDeque<ConnectionHandle>,
    occupied: HashMap<ConnectionId, ConnectionHandle>,
    /// Slots reserved by connects in flight
    pending: usize,
    released: bool,
}

impl PoolState {
    fn reserved(&self) -> usize {
        self.occupied.len() + self.pending
    }

    fn open(&self) -> usize {
        self.reserved() + self.idle.len()
    }
}

/// A slot counted in `pending` while a connect is in flight.
///
/// Dropping the reservation gives the slot back, so a caller that abandons
/// `get` mid-connect does not shrink the pool.
struct SlotReservation<'a> {
    state: &'a Mutex<PoolState>,
    settled: bool,
}

impl<'a> SlotReservation<'a> {
    /// Count a new slot; the caller holds the pool lock
    fn reserve(lock: &'a Mutex<PoolState>, state: &mut PoolState) -> Self {
        state.pending += 1;
        Self {
            state: lock,
            settled: false,
        }
    }

    /// Hand the slot back under an already held lock
    fn settle(mut self, state: &mut PoolState) {
        state.pending -= 1;
        self.settled = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.state.lock().pending -= 1;
        }
    }
}

struct PoolInner {
    account: Account,
    config: ConnectionPoolConfig,
    connection_config: ConnectionConfig,
    factory: Arc<dyn ConnectionFactory>,
    metrics: Arc<Metrics>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Connect into a reserved slot
    async fn open_reserved(&self, reservation: SlotReservation<'_>) -> Result<ConnectionHandle> {
        let result = establish(
            self.factory.as_ref(),
            &self.account,
            &self.connection_config,
            &self.metrics,
        )
        .await;

        let committed = {
            let mut state = self.state.lock();
            reservation.settle(&mut state);
            let conn = result?;
            if state.released {
                Err(conn)
            } else {
                state.occupied.insert(conn.id(), conn.clone());
                Ok(conn)
            }
        };

        match committed {
            Ok(conn) => {
                self.metrics.increase_connections_occupied();
                debug!(connection_id = %conn.id(), "Opened new pooled connection");
                Ok(conn)
            }
            Err(conn) => {
                conn.close(&self.metrics).await;
                Err(Error::Released)
            }
        }
    }

    /// Evict the expired prefix of the idle list
    async fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            while let Some(front) = state.idle.front() {
                if !front.is_expired(now, self.config.idle_timeout, self.config.lifespan) {
                    break;
                }
                if let Some(conn) = state.idle.pop_front() {
                    expired.push(conn);
                }
            }
            expired
        };

        let count = expired.len();
        for conn in expired {
            debug!(connection_id = %conn.id(), "Reaping expired idle connection");
            conn.close(&self.metrics).await;
        }
        count
    }
}

/// Bounded pool of iRODS connections.
///
/// All operations take the pool lock only for in-memory bookkeeping; connects
/// and disconnects happen after it is dropped. A slot for a new connection is
/// reserved under the lock before connecting, so `occupied + pending` never
/// exceeds `max_cap`.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    shutdown: broadcast::Sender<()>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool and open `initial_cap` idle connections.
    ///
    /// Zero-valued config fields are filled with defaults before validation.
    /// If any initial connection fails, the ones already opened are
    /// disconnected and the error is returned. Spawns the reaper task, so
    /// this must run inside a tokio runtime.
    pub async fn new(
        account: Account,
        mut config: ConnectionPoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self> {
        account.validate()?;
        config.fill_defaults();
        config.validate()?;

        let metrics = config.metrics.clone().unwrap_or_default();
        let connection_config = config.connection_config();

        let mut idle = VecDeque::with_capacity(config.max_cap);
        for _ in 0..config.initial_cap {
            match establish(factory.as_ref(), &account, &connection_config, &metrics).await {
                Ok(conn) => idle.push_back(conn),
                Err(e) => {
                    for conn in idle.drain(..) {
                        conn.close(&metrics).await;
                    }
                    return Err(Error::connection_with_source(
                        format!("failed to open initial connections to {}", account.address()),
                        e,
                    ));
                }
            }
        }

        info!(
            "Connection pool for {} initialized with {} connections (max {}, max idle {})",
            account.address(),
            idle.len(),
            config.max_cap,
            config.max_idle
        );

        let reap_interval = config.reap_interval;
        let inner = Arc::new(PoolInner {
            account,
            config,
            connection_config,
            factory,
            metrics,
            state: Mutex::new(PoolState {
                idle,
                ..Default::default()
            }),
        });

        let (shutdown, _) = broadcast::channel(1);
        let reaper = spawn_reaper(Arc::downgrade(&inner), reap_interval, shutdown.subscribe());

        Ok(Self {
            inner,
            shutdown,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    /// Check out a connection.
    ///
    /// Returns `(connection, is_new)`. Reuses the most recently returned idle
    /// connection when one is still connected; disconnected idle connections
    /// found on the way are dropped. Otherwise opens a new connection.
    /// Fails with [`Error::PoolFull`] when `max_cap` connections are occupied.
    pub async fn get(&self) -> Result<(ConnectionHandle, bool)> {
        let mut stale = Vec::new();
        let reused = {
            let mut state = self.inner.state.lock();
            if state.released {
                return Err(Error::Released);
            }
            if state.reserved() >= self.inner.config.max_cap {
                return Err(Error::pool_full(format!(
                    "{} of {} connections occupied",
                    state.reserved(),
                    self.inner.config.max_cap
                )));
            }

            let mut reused = None;
            while let Some(conn) = state.idle.pop_back() {
                if conn.is_connected() {
                    reused = Some(conn);
                    break;
                }
                stale.push(conn);
            }

            match reused {
                Some(conn) => {
                    state.occupied.insert(conn.id(), conn.clone());
                    Ok(conn)
                }
                None => Err(SlotReservation::reserve(&self.inner.state, &mut state)),
            }
        };

        for conn in stale {
            debug!(connection_id = %conn.id(), "Dropping disconnected idle connection");
            conn.close(&self.inner.metrics).await;
        }

        match reused {
            Ok(conn) => {
                self.inner.metrics.increase_connections_occupied();
                debug!(connection_id = %conn.id(), "Reusing idle connection");
                Ok((conn, false))
            }
            Err(reservation) => {
                let conn = self.inner.open_reserved(reservation).await?;
                Ok((conn, true))
            }
        }
    }

    /// Check out a newly opened connection, never an idle one.
    ///
    /// When the pool's open connections already reach `max_cap`, the oldest
    /// idle connection is evicted to make room. Fails with
    /// [`Error::PoolFull`] when every slot is occupied.
    pub async fn get_new(&self) -> Result<ConnectionHandle> {
        let (evicted, reservation) = {
            let mut state = self.inner.state.lock();
            if state.released {
                return Err(Error::Released);
            }
            if state.reserved() >= self.inner.config.max_cap {
                return Err(Error::pool_full(format!(
                    "{} of {} connections occupied, no idle connection to evict",
                    state.reserved(),
                    self.inner.config.max_cap
                )));
            }

            let evicted = if state.open() >= self.inner.config.max_cap {
                state.idle.pop_front()
            } else {
                None
            };
            (evicted, SlotReservation::reserve(&self.inner.state, &mut state))
        };

        if let Some(conn) = evicted {
            debug!(connection_id = %conn.id(), "Evicting idle connection to make room");
            conn.close(&self.inner.metrics).await;
        }

        self.inner.open_reserved(reservation).await
    }

    /// Return a checked-out connection.
    ///
    /// Disconnected connections are dropped silently; connections older than
    /// `lifespan` are disconnected instead of being kept. Otherwise the
    /// connection joins the back of the idle list, and the oldest idle
    /// connections are evicted while there are more than `max_idle`.
    /// Fails with [`Error::NotOccupied`] if the pool did not hand it out.
    pub async fn return_connection(&self, conn: &ConnectionHandle) -> Result<()> {
        let to_close = {
            let mut state = self.inner.state.lock();
            if state.released {
                debug!(connection_id = %conn.id(), "Connection returned after pool release");
                return Ok(());
            }
            if state.occupied.remove(&conn.id()).is_none() {
                return Err(Error::NotOccupied { id: conn.id() });
            }
            self.inner.metrics.decrease_connections_occupied();

            if !conn.is_connected() {
                debug!(connection_id = %conn.id(), "Dropping disconnected connection on return");
                vec![conn.clone()]
            } else if conn.age() > self.inner.config.lifespan {
                debug!(connection_id = %conn.id(), "Retiring connection past its lifespan");
                vec![conn.clone()]
            } else {
                state.idle.push_back(conn.clone());
                let mut evicted = Vec::new();
                while state.idle.len() > self.inner.config.max_idle {
                    if let Some(oldest) = state.idle.pop_front() {
                        evicted.push(oldest);
                    }
                }
                evicted
            }
        };

        for conn in to_close {
            conn.close(&self.inner.metrics).await;
        }
        Ok(())
    }

    /// Remove a connection from the occupied set and disconnect it
    pub async fn discard(&self, conn: &ConnectionHandle) {
        let tracked = self.inner.state.lock().occupied.remove(&conn.id()).is_some();

        if tracked {
            self.inner.metrics.decrease_connections_occupied();
            debug!(connection_id = %conn.id(), "Discarding connection");
            conn.close(&self.inner.metrics).await;
        } else if conn.is_connected() {
            conn.close(&self.inner.metrics).await;
        }
    }

    /// Disconnect every connection and stop the reaper. Idempotent.
    pub async fn release(&self) {
        let (connections, occupied) = {
            let mut state = self.inner.state.lock();
            if state.released {
                return;
            }
            state.released = true;
            let occupied = state.occupied.len();
            let mut all: Vec<_> = state.idle.drain(..).collect();
            all.extend(state.occupied.drain().map(|(_, conn)| conn));
            (all, occupied)
        };

        let _ = self.shutdown.send(());
        let reaper = self.reaper.lock().take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        for _ in 0..occupied {
            self.inner.metrics.decrease_connections_occupied();
        }
        for conn in &connections {
            conn.close(&self.inner.metrics).await;
        }

        info!(
            "Connection pool for {} released ({} connections closed)",
            self.inner.account.address(),
            connections.len()
        );
    }

    /// Run one reaper pass now, returning the number of evicted connections
    pub async fn reap_idle_connections(&self) -> usize {
        self.inner.reap_idle().await
    }

    /// Occupied plus idle connections
    pub fn open_connections(&self) -> usize {
        let state = self.inner.state.lock();
        state.occupied.len() + state.idle.len()
    }

    /// Connections currently checked out
    pub fn occupied_connections(&self) -> usize {
        self.inner.state.lock().occupied.len()
    }

    /// Connections waiting in the idle list
    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Slots left before `get` reports the pool full
    pub fn available_connections(&self) -> usize {
        let state = self.inner.state.lock();
        self.inner.config.max_cap.saturating_sub(state.reserved())
    }

    /// Configured `max_cap`
    pub fn max_connections(&self) -> usize {
        self.inner.config.max_cap
    }

    /// Whether `release` has run
    pub fn is_released(&self) -> bool {
        self.inner.state.lock().released
    }

    /// Effective configuration (defaults filled)
    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.inner.config
    }

    /// Account the pool connects as
    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    /// Metrics sink
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Open a connection that the pool does not track
    pub(crate) async fn open_unmanaged(&self) -> Result<ConnectionHandle> {
        establish(
            self.inner.factory.as_ref(),
            &self.inner.account,
            &self.inner.connection_config,
            &self.inner.metrics,
        )
        .await
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("address", &self.inner.account.address())
            .field("idle", &state.idle.len())
            .field("occupied", &state.occupied.len())
            .field("pending", &state.pending)
            .field("max_cap", &self.inner.config.max_cap)
            .field("released", &state.released)
            .finish()
    }
}

/// Background task evicting expired idle connections every `period`
fn spawn_reaper(
    pool: Weak<PoolInner>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    let evicted = pool.reap_idle().await;
                    if evicted > 0 {
                        debug!(evicted, "Reaper evicted idle connections");
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
        debug!("Connection reaper stopped");
    })
}
