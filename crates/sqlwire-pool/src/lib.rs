//! Connection pooling for sqlwire MySQL connections.
//!
//! Two pools share one configuration and one set of statistics:
//!
//! - [`Pool`] hands out blocking [`MySqlConnection`]s to threads. Callers
//!   that find every connection reserved and the pool at capacity wait on a
//!   condition variable, re-checking every `retry_interval`, and fail with a
//!   `Pool(Timeout)` error once `acquire_timeout` has passed.
//! - [`EventPool`] hands out [`EventConnection`]s on a single-threaded event
//!   loop. Requests wait in a FIFO queue and are served, oldest first, each
//!   time a connection reports itself free.
//!
//! [`MySqlConnection`]: sqlwire_mysql::MySqlConnection
//! [`EventConnection`]: sqlwire_mysql::EventConnection

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlwire_core::{ConfigError, Error, PoolError, PoolErrorKind};

pub mod blocking;
pub mod event;

pub use blocking::{Pool, PooledConnection};
pub use event::EventPool;

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened when the pool is built
    pub min_connections: usize,
    /// Upper bound on open connections
    pub max_connections: usize,
    /// How long an acquire may wait before failing
    pub acquire_timeout: Duration,
    /// How often a blocked acquire re-checks the pool
    pub retry_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_millis(500),
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Check the bounds: at least one connection, and `min <= max`.
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| {
            Error::Config(ConfigError {
                message,
                source: None,
            })
        };
        if self.max_connections == 0 {
            return Err(invalid("max_connections must be at least 1".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(invalid(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(invalid("retry_interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Established connections (idle + active)
    pub total_connections: usize,
    /// Connections free to be handed out
    pub idle_connections: usize,
    /// Connections reserved by a caller
    pub active_connections: usize,
    /// Acquire requests still waiting
    pub pending_requests: usize,
}

pub(crate) fn pool_closed() -> Error {
    Error::Pool(PoolError {
        kind: PoolErrorKind::Closed,
        message: "pool already closed".to_string(),
        source: None,
    })
}

pub(crate) fn acquire_timeout(waited: Duration, max_connections: usize) -> Error {
    Error::Pool(PoolError {
        kind: PoolErrorKind::Timeout,
        message: format!(
            "no connection available after {}ms ({max_connections} in use)",
            waited.as_millis()
        ),
        source: None,
    })
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sqlwire_core::Result;
    use sqlwire_mysql::mock::ScriptedTransport;
    use sqlwire_mysql::{MySqlConfig, MySqlConnection};

    pub(crate) use sqlwire_mysql::mock::ok_packet;

    /// Connector over scripted transports: each connection logs in with the
    /// next connection id, then replays `replies`.
    pub(crate) fn connector(
        opened: &Arc<AtomicUsize>,
        replies: impl Fn() -> Vec<Vec<u8>> + Send + Sync + 'static,
    ) -> impl Fn() -> Result<MySqlConnection<ScriptedTransport>> + Send + Sync + 'static {
        let opened = Arc::clone(opened);
        move || {
            let id = opened.fetch_add(1, Ordering::SeqCst) + 1;
            let transport = ScriptedTransport::with_login(u32::try_from(id).unwrap());
            for reply in replies() {
                transport.push(reply);
            }
            MySqlConnection::with_transport(transport, MySqlConfig::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_retry_budget() {
        let config = PoolConfig::default();
        assert_eq!(config.acquire_timeout.as_millis() / config.retry_interval.as_millis(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bounds() {
        assert!(PoolConfig::new(0).validate().is_err());
        assert!(PoolConfig::new(2).min_connections(3).validate().is_err());
        assert!(
            PoolConfig::new(2)
                .retry_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(PoolConfig::new(5).min_connections(2).validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"min_connections":2,"max_connections":5}"#).unwrap();
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.acquire_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_pool_errors_classify() {
        assert!(acquire_timeout(Duration::from_millis(500), 3).is_retryable());
        assert!(!pool_closed().is_retryable());
    }
}
