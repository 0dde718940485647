//! Connection metrics
//!
//! [`Metrics`] keeps in-process atomic counters that tests and callers can
//! snapshot, and mirrors every update into the `metrics` crate facade so an
//! installed recorder (Prometheus, statsd, ...) sees them as well.
//!
//! A sink is injected into the pool through
//! [`ConnectionPoolConfig::metrics`](crate::config::ConnectionPoolConfig::metrics);
//! pools created without one get a private sink.
//!
//! # Metric names
//!
//! - `irods_client_connections_opened` (gauge)
//! - `irods_client_connections_occupied` (gauge)
//! - `irods_client_connection_pool_failures_total`
//! - `irods_client_connection_failures_total`
//! - `irods_client_transaction_refresh_failures_total`

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Connections currently open (idle, occupied or unmanaged)
    pub connections_opened: u64,
    /// Connections currently checked out of the pool
    pub connections_occupied: u64,
    /// Times the pool could not satisfy a request and the session degraded
    pub connection_pool_failures: u64,
    /// Failed connect attempts
    pub connection_failures: u64,
    /// Failed transaction refresh attempts
    pub transaction_refresh_failures: u64,
}

/// Atomic connection counters
#[derive(Debug, Default)]
pub struct Metrics {
    connections_opened: AtomicU64,
    connections_occupied: AtomicU64,
    connection_pool_failures: AtomicU64,
    connection_failures: AtomicU64,
    transaction_refresh_failures: AtomicU64,
}

impl Metrics {
    /// Create a new sink with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly opened connection
    pub fn increase_connections_opened(&self) {
        let value = self.connections_opened.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("irods_client_connections_opened").set(value as f64);
    }

    /// Record a closed connection
    pub fn decrease_connections_opened(&self) {
        let value = saturating_decrement(&self.connections_opened);
        metrics::gauge!("irods_client_connections_opened").set(value as f64);
    }

    /// Record a connection checked out of the pool
    pub fn increase_connections_occupied(&self) {
        let value = self.connections_occupied.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("irods_client_connections_occupied").set(value as f64);
    }

    /// Record a connection leaving the occupied set
    pub fn decrease_connections_occupied(&self) {
        let value = saturating_decrement(&self.connections_occupied);
        metrics::gauge!("irods_client_connections_occupied").set(value as f64);
    }

    /// Record that the pool was full or a fallback path was taken
    pub fn record_pool_failure(&self) {
        self.connection_pool_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("irods_client_connection_pool_failures_total").increment(1);
    }

    /// Record a failed connect attempt
    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("irods_client_connection_failures_total").increment(1);
    }

    /// Record a failed transaction refresh
    pub fn record_refresh_failure(&self) {
        self.transaction_refresh_failures
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("irods_client_transaction_refresh_failures_total").increment(1);
    }

    /// Snapshot current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_occupied: self.connections_occupied.load(Ordering::Relaxed),
            connection_pool_failures: self.connection_pool_failures.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            transaction_refresh_failures: self
                .transaction_refresh_failures
                .load(Ordering::Relaxed),
        }
    }
}

fn saturating_decrement(counter: &AtomicU64) -> u64 {
    match counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1)) {
        Ok(previous) => previous - 1,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gauges() {
        let metrics = Metrics::new();

        metrics.increase_connections_opened();
        metrics.increase_connections_opened();
        metrics.increase_connections_occupied();
        metrics.decrease_connections_opened();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 1);
        assert_eq!(snapshot.connections_occupied, 1);
    }

    #[test]
    fn test_gauges_do_not_underflow() {
        let metrics = Metrics::new();
        metrics.decrease_connections_opened();
        metrics.decrease_connections_occupied();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 0);
        assert_eq!(snapshot.connections_occupied, 0);
    }

    #[test]
    fn test_failure_counters() {
        let metrics = Metrics::new();

        metrics.record_pool_failure();
        metrics.record_pool_failure();
        metrics.record_connection_failure();
        metrics.record_refresh_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection_pool_failures, 2);
        assert_eq!(snapshot.connection_failures, 1);
        assert_eq!(snapshot.transaction_refresh_failures, 1);
    }
}
