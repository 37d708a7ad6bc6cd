//! Thread-safe pool of blocking connections.

use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use sqlwire_core::{Error, Result, Row, Value};
use sqlwire_mysql::{MySqlConfig, MySqlConnection, QueryStatus, TcpTransport, Transport};
use tracing::{debug, warn};

use crate::{PoolConfig, PoolStats, acquire_timeout, pool_closed};

type Connector<T> = Box<dyn Fn() -> Result<MySqlConnection<T>> + Send + Sync>;

struct PoolState<T: Transport> {
    connections: Vec<Arc<MySqlConnection<T>>>,
    /// Connections being opened outside the lock
    creating: usize,
    waiting: usize,
    closed: bool,
}

/// A pool of [`MySqlConnection`]s shared between threads.
///
/// A connection is reserved for the lifetime of the [`PooledConnection`]
/// guard returned by [`get_connection`](Self::get_connection). Dropping the
/// guard releases it and wakes one waiting caller.
pub struct Pool<T: Transport = TcpTransport> {
    config: PoolConfig,
    connector: Connector<T>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

impl<T: Transport> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Pool<TcpTransport> {
    /// Pool of TCP connections to the server described by `mysql`.
    pub fn connect(mysql: MySqlConfig, config: PoolConfig) -> Result<Self> {
        Self::with_connector(config, move || MySqlConnection::connect(mysql.clone()))
    }
}

impl<T: Transport> Pool<T> {
    /// Build a pool whose connections come from `connector`, opening
    /// `min_connections` of them before returning.
    pub fn with_connector(
        config: PoolConfig,
        connector: impl Fn() -> Result<MySqlConnection<T>> + Send + Sync + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let connector: Connector<T> = Box::new(connector);
        let mut connections = Vec::with_capacity(config.max_connections);
        for _ in 0..config.min_connections {
            connections.push(Arc::new(connector()?));
        }
        debug!(
            min = config.min_connections,
            max = config.max_connections,
            "pool created"
        );
        Ok(Self {
            config,
            connector,
            state: Mutex::new(PoolState {
                connections,
                creating: 0,
                waiting: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Reserve a connection, opening a new one if every connection is busy
    /// and the pool has room.
    ///
    /// When the pool is full this waits, re-checking every `retry_interval`,
    /// and fails with `Pool(Timeout)` after `acquire_timeout`.
    pub fn get_connection(&self) -> Result<PooledConnection<'_, T>> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(pool_closed());
            }
            state
                .connections
                .retain(|conn| conn.is_reserved() || conn.is_usable());
            if let Some(conn) = state.connections.iter().find(|conn| conn.try_reserve()) {
                return Ok(self.lease(Arc::clone(conn)));
            }

            if state.connections.len() + state.creating < self.config.max_connections {
                state.creating += 1;
                drop(state);
                let created = (self.connector)();
                state = self.lock();
                state.creating -= 1;
                match created {
                    Ok(conn) => {
                        let conn = Arc::new(conn);
                        conn.try_reserve();
                        state.connections.push(Arc::clone(&conn));
                        debug!(total = state.connections.len(), "pool grew");
                        return Ok(self.lease(conn));
                    }
                    Err(e) => {
                        // Someone else may be able to use the freed slot
                        self.available.notify_one();
                        return Err(e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    waited_ms = (now - started).as_millis(),
                    "pool acquire timed out"
                );
                return Err(acquire_timeout(now - started, self.config.max_connections));
            }
            let wait = self
                .config
                .retry_interval
                .min(deadline.saturating_duration_since(now));
            state.waiting += 1;
            state = self
                .available
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            state.waiting -= 1;
        }
    }

    /// Run `sql` on a pooled connection and collect its rows.
    ///
    /// A statement without a result set yields no rows.
    pub fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.get_connection()?.query(sql)?.rows()
    }

    pub fn query_with_params(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.get_connection()?.query_with_params(sql, params)?.rows()
    }

    pub fn execute(&self, sql: &str) -> Result<QueryStatus> {
        self.get_connection()?.execute(sql)
    }

    /// Run `body` in a transaction on one pooled connection.
    pub fn transaction<R>(&self, body: impl FnOnce(&MySqlConnection<T>) -> Result<R>) -> Result<R> {
        let conn = self.get_connection()?;
        conn.transaction(body)
    }

    /// Close every idle connection and refuse further acquires. Connections
    /// still reserved are closed when their guard is dropped.
    pub fn close(&self) -> Result<()> {
        let idle = {
            let mut state = self.lock();
            if state.closed {
                return Err(pool_closed());
            }
            state.closed = true;
            let (reserved, idle): (Vec<_>, Vec<_>) = state
                .connections
                .drain(..)
                .partition(|conn| conn.is_reserved());
            state.connections = reserved;
            idle
        };
        self.available.notify_all();
        debug!(closing = idle.len(), "pool closed");
        for conn in idle {
            if let Err(e) = conn.close() {
                debug!(error = %e, "error closing pooled connection");
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let active = state
            .connections
            .iter()
            .filter(|conn| conn.is_reserved())
            .count();
        PoolStats {
            total_connections: state.connections.len(),
            idle_connections: state.connections.len() - active,
            active_connections: active,
            pending_requests: state.waiting,
        }
    }

    pub fn pooled_connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn available_connection_count(&self) -> usize {
        self.stats().idle_connections
    }

    pub fn min_pool_size(&self) -> usize {
        self.config.min_connections
    }

    pub fn max_pool_size(&self) -> usize {
        self.config.max_connections
    }

    fn lease(&self, conn: Arc<MySqlConnection<T>>) -> PooledConnection<'_, T> {
        PooledConnection { pool: self, conn }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, conn: &Arc<MySqlConnection<T>>) {
        if conn.is_transacting() {
            warn!(
                connection_id = conn.connection_id(),
                "connection returned with an open transaction; rolling back"
            );
            if let Err(e) = conn.rollback() {
                warn!(error = %e, "rollback on release failed");
            }
        }
        let mut state = self.lock();
        if state.closed || !conn.is_usable() {
            state.connections.retain(|other| !Arc::ptr_eq(other, conn));
            drop(state);
            if !conn.is_closed() {
                if let Err(e) = conn.close() {
                    debug!(error = %e, "error closing released connection");
                }
            }
        } else {
            drop(state);
        }
        conn.release();
        self.available.notify_one();
    }
}

/// A connection reserved from a [`Pool`]; released on drop.
pub struct PooledConnection<'p, T: Transport = TcpTransport> {
    pool: &'p Pool<T>,
    conn: Arc<MySqlConnection<T>>,
}

impl<T: Transport> std::fmt::Debug for PooledConnection<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Deref for PooledConnection<'_, T> {
    type Target = MySqlConnection<T>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<T: Transport> Drop for PooledConnection<'_, T> {
    fn drop(&mut self) {
        self.pool.give_back(&self.conn);
    }
}
