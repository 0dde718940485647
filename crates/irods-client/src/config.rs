//! Pool and session configuration
//!
//! Both structs deserialize with `#[serde(default)]`, so a config file only
//! needs the keys it wants to change. Durations are written in milliseconds.
//!
//! ```rust,ignore
//! let mut config = ConnectionPoolConfig::new()
//!     .with_max_cap(20)
//!     .with_idle_timeout(Duration::from_secs(120));
//! config.fill_defaults();
//! config.validate()?;
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Smallest accepted `max_cap`
pub const MIN_MAX_CAP: usize = 1;
/// Default ceiling on connections
pub const DEFAULT_MAX_CAP: usize = 10;
/// Default number of connections opened up front
pub const DEFAULT_INITIAL_CAP: usize = 1;
/// Default maximum connection age
pub const DEFAULT_LIFESPAN: Duration = Duration::from_secs(60 * 60);
/// Default maximum idle duration
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default request timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default socket buffer size
pub const DEFAULT_TCP_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Default application name
pub const DEFAULT_APPLICATION_NAME: &str = "irods-client";
/// Default interval between reaper passes
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Serialization helpers for Duration (as milliseconds)
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Connections opened when the pool is created
    pub initial_cap: usize,
    /// Hard ceiling on connections checked out at once
    #[validate(range(min = 1))]
    pub max_cap: usize,
    /// Ceiling on idle connections retained after a return
    pub max_idle: usize,
    /// Connections older than this are retired
    #[serde(with = "duration_ms")]
    pub lifespan: Duration,
    /// Idle connections unused for longer than this are reaped
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Upper bound on establishing a connection
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Upper bound on a single request/response exchange
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
    /// Interval between background reaper passes
    #[serde(with = "duration_ms")]
    pub reap_interval: Duration,
    /// Application name reported to the server
    #[validate(length(min = 1, max = 255))]
    pub application_name: String,
    /// Socket send/receive buffer size in bytes
    pub tcp_buffer_size: usize,
    /// Metrics sink; the pool creates its own when unset
    #[serde(skip)]
    pub metrics: Option<Arc<Metrics>>,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            initial_cap: DEFAULT_INITIAL_CAP,
            max_cap: DEFAULT_MAX_CAP,
            max_idle: DEFAULT_MAX_CAP,
            lifespan: DEFAULT_LIFESPAN,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            tcp_buffer_size: DEFAULT_TCP_BUFFER_SIZE,
            metrics: None,
        }
    }
}

impl ConnectionPoolConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial pool size
    pub fn with_initial_cap(mut self, cap: usize) -> Self {
        self.initial_cap = cap;
        self
    }

    /// Set maximum number of occupied connections
    pub fn with_max_cap(mut self, cap: usize) -> Self {
        self.max_cap = cap;
        self
    }

    /// Set maximum number of idle connections
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = lifespan;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
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

    /// Set reaper interval
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set TCP buffer size
    pub fn with_tcp_buffer_size(mut self, size: usize) -> Self {
        self.tcp_buffer_size = size;
        self
    }

    /// Inject a metrics sink
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace zero or missing values with defaults and clamp the caps.
    pub fn fill_defaults(&mut self) {
        if self.max_cap == 0 {
            self.max_cap = DEFAULT_MAX_CAP;
        }
        self.max_cap = self.max_cap.max(MIN_MAX_CAP);

        if self.initial_cap == 0 {
            self.initial_cap = DEFAULT_INITIAL_CAP;
        }
        self.initial_cap = self.initial_cap.min(self.max_cap);

        if self.max_idle == 0 {
            self.max_idle = self.max_cap;
        }
        self.max_idle = self.max_idle.min(self.max_cap);

        if self.lifespan.is_zero() {
            self.lifespan = DEFAULT_LIFESPAN;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if self.connect_timeout.is_zero() {
            self.connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        }
        if self.operation_timeout.is_zero() {
            self.operation_timeout = DEFAULT_OPERATION_TIMEOUT;
        }
        if self.reap_interval.is_zero() {
            self.reap_interval = DEFAULT_REAP_INTERVAL;
        }
        if self.application_name.is_empty() {
            self.application_name = DEFAULT_APPLICATION_NAME.to_string();
        }
        if self.tcp_buffer_size == 0 {
            self.tcp_buffer_size = DEFAULT_TCP_BUFFER_SIZE;
        }
    }

    /// Check the configuration without modifying it
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)?;

        if self.max_cap < MIN_MAX_CAP {
            return Err(Error::config(format!(
                "max_cap must be at least {}, got {}",
                MIN_MAX_CAP, self.max_cap
            )));
        }
        if self.initial_cap > self.max_cap {
            return Err(Error::config(format!(
                "initial_cap ({}) exceeds max_cap ({})",
                self.initial_cap, self.max_cap
            )));
        }
        if self.max_idle > self.max_cap {
            return Err(Error::config(format!(
                "max_idle ({}) exceeds max_cap ({})",
                self.max_idle, self.max_cap
            )));
        }

        let durations = [
            ("lifespan", self.lifespan),
            ("idle_timeout", self.idle_timeout),
            ("connect_timeout", self.connect_timeout),
            ("operation_timeout", self.operation_timeout),
            ("reap_interval", self.reap_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(())
    }

    /// Transport settings derived from this configuration
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            application_name: self.application_name.clone(),
            connect_timeout: self.connect_timeout,
            operation_timeout: self.operation_timeout,
            tcp_buffer_size: self.tcp_buffer_size,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pool settings
    #[serde(flatten)]
    pub pool: ConnectionPoolConfig,
    /// Refresh the server transaction on reused connections.
    /// Ignored for anonymous accounts.
    pub start_new_transaction: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool: ConnectionPoolConfig::default(),
            start_new_transaction: true,
        }
    }
}

impl SessionConfig {
    /// Create a session configuration around pool settings
    pub fn new(pool: ConnectionPoolConfig) -> Self {
        Self {
            pool,
            ..Default::default()
        }
    }

    /// Enable/disable transaction refresh on reuse
    pub fn with_start_new_transaction(mut self, enabled: bool) -> Self {
        self.start_new_transaction = enabled;
        self
    }

    /// Fill pool defaults
    pub fn fill_defaults(&mut self) {
        self.pool.fill_defaults();
    }

    /// Validate pool settings
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = ConnectionPoolConfig::new()
            .with_initial_cap(2)
            .with_max_cap(20)
            .with_max_idle(5)
            .with_lifespan(Duration::from_secs(600))
            .with_application_name("ingest");

        assert_eq!(config.initial_cap, 2);
        assert_eq!(config.max_cap, 20);
        assert_eq!(config.max_idle, 5);
        assert_eq!(config.lifespan, Duration::from_secs(600));
        assert_eq!(config.application_name, "ingest");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fill_defaults_from_zero() {
        let mut config = ConnectionPoolConfig {
            initial_cap: 0,
            max_cap: 0,
            max_idle: 0,
            lifespan: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            operation_timeout: Duration::ZERO,
            reap_interval: Duration::ZERO,
            application_name: String::new(),
            tcp_buffer_size: 0,
            metrics: None,
        };
        assert!(config.validate().is_err());

        config.fill_defaults();

        assert_eq!(config.max_cap, DEFAULT_MAX_CAP);
        assert_eq!(config.initial_cap, 1);
        assert_eq!(config.max_idle, DEFAULT_MAX_CAP);
        assert_eq!(config.lifespan, DEFAULT_LIFESPAN);
        assert_eq!(config.application_name, DEFAULT_APPLICATION_NAME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fill_defaults_clamps_to_max_cap() {
        let mut config = ConnectionPoolConfig::new()
            .with_max_cap(3)
            .with_initial_cap(8)
            .with_max_idle(8);
        config.fill_defaults();

        assert_eq!(config.initial_cap, 3);
        assert_eq!(config.max_idle, 3);
    }

    #[test]
    fn test_validate_rejects_initial_above_max() {
        let config = ConnectionPoolConfig::new()
            .with_max_cap(2)
            .with_initial_cap(3);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("initial_cap"));
    }

    #[test]
    fn test_session_config_checks_pool_field_rules() {
        let config = SessionConfig::new(
            ConnectionPoolConfig::new().with_application_name("a".repeat(300)),
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("application_name"));

        let config = SessionConfig::new(ConnectionPoolConfig::new().with_max_cap(0));
        assert!(config.validate().is_err());
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_connection_config_projection() {
        let config = ConnectionPoolConfig::new()
            .with_application_name("sync")
            .with_connect_timeout(Duration::from_secs(3))
            .with_tcp_buffer_size(65536);
        let conn = config.connection_config();

        assert_eq!(conn.application_name, "sync");
        assert_eq!(conn.connect_timeout, Duration::from_secs(3));
        assert_eq!(conn.tcp_buffer_size, 65536);
    }
}
