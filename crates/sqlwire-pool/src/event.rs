//! Single-threaded pool of event-driven connections.
//!
//! Every acquire request joins a FIFO wait queue. Requests are served only
//! once the pool is ready (its first `min_connections` connections have
//! authenticated) and then oldest first, each time a connection reports
//! itself free. A connection is free when it has nothing in flight, nothing
//! queued and no open transaction, so a caller that wants to run several
//! commands on one connection must queue the next command before the
//! previous one completes, or run them in a transaction.
//!
//! When more requests are waiting than there are connections still being
//! opened, and the pool has room, another connection is opened.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Instant;

use sqlwire_core::{ConnectionErrorKind, Error, Result, Value};
use sqlwire_mysql::event::{Deferred, Resolver, deferred};
use sqlwire_mysql::{EventConnection, EventTransport, MySqlConfig, QueryOutcome};
use tracing::{debug, warn};

use crate::{PoolConfig, PoolStats, acquire_timeout, pool_closed};

type Connector<T> = Box<dyn FnMut() -> T>;
type Granted<T> = Result<EventConnection<T>>;

struct Member<T: EventTransport> {
    id: u64,
    conn: EventConnection<T>,
    authenticated: bool,
    reserved: bool,
}

impl<T: EventTransport> Member<T> {
    fn is_available(&self) -> bool {
        self.authenticated && !self.reserved && self.conn.is_ready()
    }
}

struct Waiter<T: EventTransport> {
    since: Instant,
    resolver: Resolver<Granted<T>>,
}

struct PoolInner<T: EventTransport> {
    config: PoolConfig,
    mysql: MySqlConfig,
    connector: Connector<T>,
    members: Vec<Member<T>>,
    waiters: VecDeque<Waiter<T>>,
    next_id: u64,
    created: usize,
    ready: bool,
    closed: bool,
    on_ready: Option<Box<dyn FnOnce()>>,
    on_new_connection: Option<Box<dyn FnMut(&EventConnection<T>)>>,
}

impl<T: EventTransport> PoolInner<T> {
    fn connecting(&self) -> usize {
        self.members.iter().filter(|m| !m.authenticated).count()
    }

    fn authenticated(&self) -> usize {
        self.members.iter().filter(|m| m.authenticated).count()
    }

    /// Waiting on the first `min_connections` handshakes.
    fn warming(&self) -> bool {
        !self.ready && self.connecting() > 0
    }

    /// Become ready once every initial connection has authenticated or
    /// failed, handing back the `on_ready` hook to run.
    fn settle(&mut self) -> Option<Box<dyn FnOnce()>> {
        if self.ready || self.connecting() > 0 {
            return None;
        }
        self.ready = true;
        debug!(
            connections = self.members.len(),
            wanted = self.config.min_connections,
            "event pool ready"
        );
        self.on_ready.take()
    }

    fn member(&mut self, id: u64) -> Option<&mut Member<T>> {
        self.members.iter_mut().find(|m| m.id == id)
    }
}

/// Pool of [`EventConnection`]s driven by the host's event loop.
pub struct EventPool<T: EventTransport> {
    inner: Rc<RefCell<PoolInner<T>>>,
}

impl<T: EventTransport> Clone for EventPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: EventTransport> std::fmt::Debug for EventPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventPool")
            .field("config", &inner.config)
            .field("members", &inner.members.len())
            .field("waiters", &inner.waiters.len())
            .field("ready", &inner.ready)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl<T: EventTransport> EventPool<T> {
    /// Build a pool and start opening `min_connections` connections.
    ///
    /// `connector` supplies a fresh, unopened transport for each new
    /// connection. It must not call back into the pool.
    pub fn new(
        config: PoolConfig,
        mysql: MySqlConfig,
        connector: impl FnMut() -> T + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let min = config.min_connections;
        let pool = Self {
            inner: Rc::new(RefCell::new(PoolInner {
                ready: min == 0,
                config,
                mysql,
                connector: Box::new(connector),
                members: Vec::new(),
                waiters: VecDeque::new(),
                next_id: 0,
                created: 0,
                closed: false,
                on_ready: None,
                on_new_connection: None,
            })),
        };
        for _ in 0..min {
            pool.spawn();
        }
        Ok(pool)
    }

    /// Run `hook` once the first `min_connections` connections have
    /// authenticated; immediately if that has already happened.
    pub fn on_ready(&self, hook: impl FnOnce() + 'static) {
        let ready = {
            let mut inner = self.inner.borrow_mut();
            if !inner.ready {
                inner.on_ready = Some(Box::new(hook));
                return;
            }
            hook
        };
        ready();
    }

    /// Run `hook` each time a new connection authenticates.
    pub fn on_new_connection(&self, hook: impl FnMut(&EventConnection<T>) + 'static) {
        self.inner.borrow_mut().on_new_connection = Some(Box::new(hook));
    }

    /// Reserve a connection. The handle resolves with it once one is free,
    /// or with `Pool(Timeout)` from [`expire_waiters`](Self::expire_waiters).
    pub fn get_connection(&self) -> Deferred<Granted<T>> {
        let (resolver, granted) = deferred();
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.closed {
                inner.waiters.push_back(Waiter {
                    since: Instant::now(),
                    resolver,
                });
                drop(inner);
                self.dispatch();
                return granted;
            }
        }
        resolver.resolve(Err(pool_closed()));
        granted
    }

    /// Hand `conn` back before it reports itself free. A connection that is
    /// still busy is returned when its work completes.
    pub fn release(&self, conn: &EventConnection<T>) {
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(member) = inner
                .members
                .iter_mut()
                .find(|m| m.conn.same_connection(conn))
            {
                if member.conn.is_ready() {
                    member.reserved = false;
                }
            }
        }
        self.dispatch();
    }

    /// Run `sql` on the next free connection and collect its result.
    pub fn query(&self, sql: impl Into<String>) -> Deferred<Result<QueryOutcome>> {
        let sql = sql.into();
        self.with_connection(move |conn| conn.query(sql))
    }

    pub fn query_with_params(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Deferred<Result<QueryOutcome>> {
        let sql = sql.into();
        self.with_connection(move |conn| conn.query_with_params(sql, params))
    }

    /// Run `body` in a transaction on one pooled connection. The connection
    /// stays reserved until the transaction commits or rolls back.
    pub fn transaction(
        &self,
        body: impl FnOnce(&EventConnection<T>) -> Deferred<Result<()>> + 'static,
    ) -> Deferred<Result<()>> {
        self.with_connection(move |conn| conn.transaction(body))
    }

    /// Reserve a connection and start a transaction on it. The connection
    /// returns to the pool after its `commit` or `rollback`.
    pub fn begin(&self) -> Deferred<Granted<T>> {
        self.with_connection(|conn| {
            let handle = conn.clone();
            conn.begin().map(move |started| started.map(|()| handle))
        })
    }

    /// Fail every request that has waited longer than `acquire_timeout`.
    /// Returns how many were failed.
    pub fn expire_waiters(&self) -> usize {
        let expired: Vec<(Waiter<T>, std::time::Duration)> = {
            let mut inner = self.inner.borrow_mut();
            let timeout = inner.config.acquire_timeout;
            let now = Instant::now();
            let mut expired = Vec::new();
            while inner
                .waiters
                .front()
                .is_some_and(|w| now.saturating_duration_since(w.since) >= timeout)
            {
                if let Some(waiter) = inner.waiters.pop_front() {
                    let waited = now.saturating_duration_since(waiter.since);
                    expired.push((waiter, waited));
                }
            }
            expired
        };
        let count = expired.len();
        if count > 0 {
            warn!(count, "pool requests timed out");
        }
        let max = self.max_pool_size();
        for (waiter, waited) in expired {
            waiter.resolver.resolve(Err(acquire_timeout(waited, max)));
        }
        count
    }

    /// Close every connection and fail waiting requests. Later requests
    /// fail with a `Pool(Closed)` error.
    pub fn close(&self) -> Result<()> {
        let (members, waiters) = {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(pool_closed());
            }
            inner.closed = true;
            let members: Vec<Member<T>> = inner.members.drain(..).collect();
            let waiters: Vec<Waiter<T>> = inner.waiters.drain(..).collect();
            (members, waiters)
        };
        debug!(
            connections = members.len(),
            waiters = waiters.len(),
            "event pool closed"
        );
        for waiter in waiters {
            waiter.resolver.resolve(Err(pool_closed()));
        }
        for member in members {
            if !member.conn.is_closed() {
                if let Err(e) = member.conn.close() {
                    debug!(error = %e, "error closing pooled connection");
                }
            }
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.borrow().ready
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        let total = inner.authenticated();
        let active = inner
            .members
            .iter()
            .filter(|m| m.authenticated && m.reserved)
            .count();
        PoolStats {
            total_connections: total,
            idle_connections: total - active,
            active_connections: active,
            pending_requests: inner.waiters.len(),
        }
    }

    /// Connections opened over the pool's lifetime, including failed ones.
    pub fn created_connection_count(&self) -> usize {
        self.inner.borrow().created
    }

    pub fn pooled_connection_count(&self) -> usize {
        self.stats().total_connections
    }

    pub fn available_connection_count(&self) -> usize {
        self.stats().idle_connections
    }

    pub fn min_pool_size(&self) -> usize {
        self.inner.borrow().config.min_connections
    }

    pub fn max_pool_size(&self) -> usize {
        self.inner.borrow().config.max_connections
    }

    fn downgrade(&self) -> Weak<RefCell<PoolInner<T>>> {
        Rc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<RefCell<PoolInner<T>>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Acquire a connection, run `work` on it and forward its result.
    fn with_connection<R: 'static>(
        &self,
        work: impl FnOnce(&EventConnection<T>) -> Deferred<Result<R>> + 'static,
    ) -> Deferred<Result<R>> {
        let (resolver, result) = deferred();
        self.get_connection().then(move |granted| match granted {
            Ok(conn) => work(&conn).then(move |outcome| resolver.resolve(outcome)),
            Err(e) => resolver.resolve(Err(e)),
        });
        result
    }

    fn spawn(&self) {
        let (conn, id) = {
            let mut inner = self.inner.borrow_mut();
            let transport = (inner.connector)();
            let conn = EventConnection::new(transport, inner.mysql.clone());
            let id = inner.next_id;
            inner.next_id += 1;
            inner.created += 1;
            inner.members.push(Member {
                id,
                conn: conn.clone(),
                authenticated: false,
                reserved: false,
            });
            (conn, id)
        };
        let weak = self.downgrade();
        conn.on_connect({
            let weak = weak.clone();
            move |result| {
                if let (Ok(()), Some(pool)) = (result, Self::upgrade(&weak)) {
                    pool.connected(id);
                }
            }
        });
        conn.on_error({
            let weak = weak.clone();
            move |error| {
                if let Some(pool) = Self::upgrade(&weak) {
                    pool.lost(id, error);
                }
            }
        });
        conn.on_freed(move || {
            if let Some(pool) = Self::upgrade(&weak) {
                pool.freed(id);
            }
        });
        debug!(id, "pool opening connection");
        conn.open();
    }

    fn connected(&self, id: u64) {
        let (conn, on_ready, on_new) = {
            let mut inner = self.inner.borrow_mut();
            let Some(member) = inner.member(id) else {
                return;
            };
            member.authenticated = true;
            let conn = member.conn.clone();
            let on_ready = inner.settle();
            (conn, on_ready, inner.on_new_connection.take())
        };
        if let Some(mut hook) = on_new {
            hook(&conn);
            let mut inner = self.inner.borrow_mut();
            if inner.on_new_connection.is_none() {
                inner.on_new_connection = Some(hook);
            }
        }
        if let Some(hook) = on_ready {
            hook();
        }
        // The connection's freed signal follows and dispatches
    }

    fn lost(&self, id: u64, error: &Error) {
        let (failed_connect, on_ready) = {
            let mut inner = self.inner.borrow_mut();
            let Some(index) = inner.members.iter().position(|m| m.id == id) else {
                return;
            };
            let member = inner.members.remove(index);
            warn!(id, error = %error, "pooled connection failed");
            if member.authenticated {
                (None, None)
            } else {
                (inner.waiters.pop_front(), inner.settle())
            }
        };
        // A connect failure is reported to the request it was opened for
        if let Some(waiter) = failed_connect {
            waiter.resolver.resolve(Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!("pool could not open a connection: {error}"),
            )));
        }
        if let Some(hook) = on_ready {
            hook();
        }
        self.dispatch();
    }

    fn freed(&self, id: u64) {
        if let Some(member) = self.inner.borrow_mut().member(id) {
            member.reserved = false;
        }
        self.dispatch();
    }

    /// Serve waiting requests with free connections, oldest first, then
    /// open more connections if requests are still waiting.
    fn dispatch(&self) {
        self.expire_waiters();
        loop {
            let grant = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                if inner.closed || inner.waiters.is_empty() || inner.warming() {
                    return;
                }
                match inner.members.iter_mut().find(|m| m.is_available()) {
                    Some(member) => {
                        member.reserved = true;
                        let conn = member.conn.clone();
                        inner.waiters.pop_front().map(|waiter| (waiter, conn))
                    }
                    None => None,
                }
            };
            let Some((waiter, conn)) = grant else {
                break;
            };
            debug!(connection_id = ?conn.connection_id(), "pool granted connection");
            waiter.resolver.resolve(Ok(conn));
        }
        self.grow();
    }

    fn grow(&self) {
        loop {
            let open_another = {
                let inner = self.inner.borrow();
                !inner.closed
                    && !inner.warming()
                    && inner.waiters.len() > inner.connecting()
                    && inner.members.len() < inner.config.max_connections
            };
            if !open_another {
                return;
            }
            self.spawn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlwire_mysql::event::{LoopbackPeer, LoopbackTransport, loopback};
    use sqlwire_mysql::mock::{login_bytes_for, ok_packet};
    use std::cell::Cell;
    use std::time::Duration;

    type Peers = Rc<RefCell<Vec<LoopbackPeer>>>;

    fn pool(config: PoolConfig) -> (EventPool<LoopbackTransport>, Peers) {
        let peers: Peers = Rc::default();
        let sink = Rc::clone(&peers);
        let pool = EventPool::new(config, MySqlConfig::new().user("app"), move || {
            let (transport, peer) = loopback();
            sink.borrow_mut().push(peer);
            transport
        })
        .unwrap();
        (pool, peers)
    }

    /// Accept and log in every connection still opening.
    fn accept_all(peers: &Peers) {
        let pending: Vec<(usize, LoopbackPeer)> = peers
            .borrow()
            .iter()
            .cloned()
            .enumerate()
            .filter(|(_, p)| p.has_pending_open())
            .collect();
        for (i, peer) in pending {
            peer.accept();
            peer.deliver(&login_bytes_for(u32::try_from(i).unwrap() + 1));
        }
    }

    #[test]
    fn test_min_connections_then_ready() {
        let (pool, peers) = pool(PoolConfig::new(4).min_connections(2));
        assert_eq!(peers.borrow().len(), 2);
        let ready = Rc::new(Cell::new(false));
        let r = Rc::clone(&ready);
        pool.on_ready(move || r.set(true));
        assert!(!pool.is_ready());
        accept_all(&peers);
        assert!(ready.get());
        assert_eq!(pool.pooled_connection_count(), 2);
        assert_eq!(pool.available_connection_count(), 2);
    }

    #[test]
    fn test_requests_wait_until_ready() {
        let (pool, peers) = pool(PoolConfig::new(2).min_connections(2));
        let mut first = pool.get_connection();
        {
            let peer = peers.borrow()[0].clone();
            peer.accept();
            peer.deliver(&login_bytes_for(1));
        }
        assert!(!first.is_ready());
        accept_all(&peers);
        assert!(first.try_take().unwrap().is_ok());
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.idle_connections + stats.active_connections, stats.total_connections);
    }

    #[test]
    fn test_freed_connection_serves_next_waiter() {
        let (pool, peers) = pool(PoolConfig::new(1).min_connections(1));
        accept_all(&peers);
        let mut a = pool.query("SELECT 1");
        let mut b = pool.query("SELECT 2");
        assert_eq!(pool.stats().pending_requests, 1);

        let peer = peers.borrow()[0].clone();
        assert!(peer.take_written().ends_with(b"SELECT 1"));
        peer.deliver(&ok_packet(0));
        assert!(a.try_take().unwrap().is_ok());
        assert!(peer.take_written().ends_with(b"SELECT 2"));
        peer.deliver(&ok_packet(0));
        assert!(b.try_take().unwrap().is_ok());
        assert_eq!(pool.available_connection_count(), 1);
    }

    #[test]
    fn test_expired_waiter_times_out() {
        let (pool, _peers) = pool(
            PoolConfig::new(1)
                .min_connections(1)
                .acquire_timeout(Duration::from_millis(5)),
        );
        let mut waiting = pool.get_connection();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(pool.expire_waiters(), 1);
        let err = waiting.try_take().unwrap().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_failed_connect_reaches_waiter() {
        let (pool, peers) = pool(PoolConfig::new(1).min_connections(1));
        let mut waiting = pool.get_connection();
        peers.borrow()[0].refuse(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(waiting.try_take().unwrap().is_err());
        assert_eq!(pool.pooled_connection_count(), 0);
    }

    #[test]
    fn test_ready_after_initial_connect_fails() {
        let (pool, peers) = pool(PoolConfig::new(2).min_connections(2));
        let ready = Rc::new(Cell::new(false));
        let r = Rc::clone(&ready);
        pool.on_ready(move || r.set(true));

        peers.borrow()[0].refuse(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(!ready.get());
        assert!(!pool.is_ready());

        let second = peers.borrow()[1].clone();
        assert!(second.accept());
        second.deliver(&login_bytes_for(2));
        assert!(ready.get());
        assert!(pool.is_ready());
        assert_eq!(pool.pooled_connection_count(), 1);

        let mut outcome = pool.query("SELECT 1");
        assert!(second.take_written().ends_with(b"SELECT 1"));
        second.deliver(&ok_packet(0));
        assert!(outcome.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_close_fails_waiters() {
        let (pool, peers) = pool(PoolConfig::new(1).min_connections(1));
        accept_all(&peers);
        let _held = pool.get_connection();
        let mut waiting = pool.get_connection();
        pool.close().unwrap();
        assert!(waiting.try_take().unwrap().is_err());
        assert!(peers.borrow()[0].is_closed());
        assert!(pool.query("SELECT 1").try_take().unwrap().is_err());
        assert!(pool.close().is_err());
    }
}
