//! Event-driven MySQL connection.
//!
//! An [`EventConnection`] owns a [`Machine`] and an [`EventTransport`]. Bytes
//! delivered by the transport are fed to the machine; the machine's effects
//! are carried out here: writes go to the transport, row and status events go
//! to the handler of the command in flight. Commands submitted while another
//! is in flight wait in a FIFO queue and are written one at a time.
//!
//! Handles are cheap clones sharing one connection. Everything runs on the
//! thread that drives the transport. User callbacks are never invoked while
//! the connection state is borrowed, so a callback may submit more queries
//! or close the connection.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::rc::{Rc, Weak};

use sqlwire_core::{ConnectionError, ConnectionErrorKind, Error, Result, Row, Value};
use tracing::{debug, info, warn};

use super::deferred::{Deferred, Resolver, deferred};
use super::machine::{Effect, Machine, Request};
use super::transport::EventTransport;
use crate::auth::Handshake;
use crate::config::MySqlConfig;
use crate::connection::QueryStatus;
use crate::protocol::{Command, build_command_packet};
use crate::types::Field;

/// One step of a command's result, in arrival order.
///
/// A result set is `Fields`, any number of `Row`s, then `End`. A command
/// without rows produces a single `Status`. `Error` ends the command early.
#[derive(Debug)]
pub enum QueryEvent {
    Fields(Vec<Field>),
    Row(Row),
    End,
    Status(QueryStatus),
    Error(Error),
}

impl QueryEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryEvent::End | QueryEvent::Status(_) | QueryEvent::Error(_)
        )
    }
}

/// The collected result of one command.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Status(QueryStatus),
    Rows { fields: Vec<Field>, rows: Vec<Row> },
}

impl QueryOutcome {
    pub fn status(&self) -> Option<QueryStatus> {
        match self {
            QueryOutcome::Status(status) => Some(*status),
            QueryOutcome::Rows { .. } => None,
        }
    }

    /// Rows of a result set; a status result has none.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryOutcome::Rows { rows, .. } => rows,
            QueryOutcome::Status(_) => Vec::new(),
        }
    }
}

type Sink = Box<dyn FnMut(QueryEvent)>;
type ConnectHook = Box<dyn FnOnce(Result<()>)>;
type ErrorHook = Box<dyn FnMut(&Error)>;
type FreedHook = Box<dyn FnMut()>;

struct Pending {
    request: Request,
    sink: Option<Sink>,
}

pub(crate) struct Shared<T> {
    transport: T,
    machine: Machine,
    config: MySqlConfig,
    queue: VecDeque<Pending>,
    current: Option<Pending>,
    connected: bool,
    closed: bool,
    transacting: bool,
    on_connect: Option<ConnectHook>,
    on_error: Option<ErrorHook>,
    on_freed: Option<FreedHook>,
}

/// Handle to an event-driven connection.
pub struct EventConnection<T: EventTransport> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T: EventTransport> Clone for EventConnection<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: EventTransport> std::fmt::Debug for EventConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("EventConnection")
            .field("state", &shared.machine.state().name())
            .field("queued", &shared.queue.len())
            .field("busy", &shared.current.is_some())
            .field("connected", &shared.connected)
            .field("closed", &shared.closed)
            .field("transacting", &shared.transacting)
            .finish()
    }
}

impl<T: EventTransport> EventConnection<T> {
    /// Wrap `transport`. Nothing is sent until [`open`](Self::open).
    pub fn new(transport: T, config: MySqlConfig) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                machine: Machine::new(&config),
                transport,
                config,
                queue: VecDeque::new(),
                current: None,
                connected: false,
                closed: false,
                transacting: false,
                on_connect: None,
                on_error: None,
                on_freed: None,
            })),
        }
    }

    /// Open the transport and authenticate. The [`on_connect`](Self::on_connect)
    /// hook reports the outcome. Queries submitted before then are queued.
    pub fn open(&self) {
        let weak = self.downgrade();
        self.shared
            .borrow_mut()
            .transport
            .open(Box::new(move |result| {
                if let Some(conn) = Self::upgrade(&weak) {
                    conn.opened(result);
                }
            }));
    }

    /// Called once: `Ok` after authentication, `Err` if it never completes.
    pub fn on_connect(&self, hook: impl FnOnce(Result<()>) + 'static) {
        self.shared.borrow_mut().on_connect = Some(Box::new(hook));
    }

    /// Called when the connection fails for good.
    pub fn on_error(&self, hook: impl FnMut(&Error) + 'static) {
        self.shared.borrow_mut().on_error = Some(Box::new(hook));
    }

    /// Called whenever the connection becomes free: nothing in flight,
    /// nothing queued, no transaction open.
    pub fn on_freed(&self, hook: impl FnMut() + 'static) {
        self.shared.borrow_mut().on_freed = Some(Box::new(hook));
    }

    /// Run `sql` and collect its whole result.
    pub fn query(&self, sql: impl Into<String>) -> Deferred<Result<QueryOutcome>> {
        let (resolver, result) = deferred();
        self.submit(Request::Query(sql.into()), collect(resolver));
        result
    }

    /// Prepare, execute and close `sql` with `params` bound to its `?`s.
    pub fn query_with_params(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Deferred<Result<QueryOutcome>> {
        let (resolver, result) = deferred();
        self.submit(
            Request::Prepared {
                sql: sql.into(),
                params,
            },
            collect(resolver),
        );
        result
    }

    /// Run `sql`, handing each [`QueryEvent`] to `handler` as it is decoded.
    pub fn query_stream(&self, sql: impl Into<String>, handler: impl FnMut(QueryEvent) + 'static) {
        self.submit(Request::Query(sql.into()), Box::new(handler));
    }

    /// Switch the default database (`COM_INIT_DB`).
    pub fn use_database(&self, database: impl Into<String>) -> Deferred<Result<QueryOutcome>> {
        let (resolver, result) = deferred();
        self.submit(Request::InitDb(database.into()), collect(resolver));
        result
    }

    pub fn ping(&self) -> Deferred<Result<QueryOutcome>> {
        let (resolver, result) = deferred();
        self.submit(Request::Ping, collect(resolver));
        result
    }

    /// Send `COM_QUIT` and close the transport.
    ///
    /// The command in flight and every queued command fail with a `Closed`
    /// connection error. Closing twice is an error.
    pub fn close(&self) -> Result<()> {
        let (current, queued) = {
            let mut shared = self.shared.borrow_mut();
            if shared.closed {
                return Err(Error::already_closed());
            }
            shared.closed = true;
            if shared.connected {
                let quit = build_command_packet(Command::Quit, &[]);
                shared.transport.write(quit, Box::new(|_| {}));
            }
            shared.connected = false;
            shared.transport.close();
            let current = shared.current.take().and_then(|pending| pending.sink);
            let queued: Vec<Pending> = shared.queue.drain(..).collect();
            (current, queued)
        };
        debug!(queued = queued.len(), "event connection closed");
        fail_all(current, queued, || {
            Error::connection(ConnectionErrorKind::Closed, "connection closed")
        });
        Ok(())
    }

    /// Authenticated, idle and with nothing queued.
    pub fn is_ready(&self) -> bool {
        let shared = self.shared.borrow();
        shared.connected
            && !shared.closed
            && shared.current.is_none()
            && shared.queue.is_empty()
            && shared.machine.is_idle()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.borrow().connected
    }

    pub fn is_closed(&self) -> bool {
        self.shared.borrow().closed
    }

    pub fn is_transacting(&self) -> bool {
        self.shared.borrow().transacting
    }

    /// Commands submitted and not yet finished, including the one in flight.
    pub fn pending_queries(&self) -> usize {
        let shared = self.shared.borrow();
        shared.queue.len() + usize::from(shared.current.is_some())
    }

    /// Name of the protocol state, for diagnostics.
    pub fn state_name(&self) -> &'static str {
        self.shared.borrow().machine.state().name()
    }

    pub fn handshake(&self) -> Option<Handshake> {
        self.shared.borrow().machine.handshake().cloned()
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.shared
            .borrow()
            .machine
            .handshake()
            .map(|handshake| handshake.connection_id)
    }

    /// Whether both handles refer to the same connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn set_transacting(&self, transacting: bool) {
        self.shared.borrow_mut().transacting = transacting;
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<Shared<T>>> {
        Rc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(weak: &Weak<RefCell<Shared<T>>>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Queue `request`; `sink` receives its events.
    pub(crate) fn submit(&self, request: Request, mut sink: Sink) {
        let mut shared = self.shared.borrow_mut();
        if shared.closed {
            drop(shared);
            sink(QueryEvent::Error(Error::already_closed()));
            return;
        }
        shared.queue.push_back(Pending {
            request,
            sink: Some(sink),
        });
        drop(shared);
        self.pump();
    }

    fn opened(&self, result: io::Result<()>) {
        if let Err(e) = result {
            let error = Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("failed to connect: {e}"),
                source: Some(Box::new(e)),
            });
            self.shared.borrow_mut().transport.close();
            self.failed(error);
            return;
        }
        let weak = self.downgrade();
        self.shared
            .borrow_mut()
            .transport
            .read(Box::new(move |chunk| {
                if let Some(conn) = Self::upgrade(&weak) {
                    conn.received(chunk);
                }
            }));
    }

    fn received(&self, chunk: io::Result<Vec<u8>>) {
        let effects = {
            let mut shared = self.shared.borrow_mut();
            if shared.closed {
                return;
            }
            match chunk {
                Ok(bytes) if bytes.is_empty() => shared.machine.lost(Error::connection(
                    ConnectionErrorKind::Disconnected,
                    "connection closed by server",
                )),
                Ok(bytes) => shared.machine.receive(&bytes),
                Err(e) => shared.machine.lost(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: format!("transport error: {e}"),
                    source: Some(Box::new(e)),
                })),
            }
        };
        self.apply(effects);
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Write(bytes) => self.write(bytes),
                Effect::Connected(handshake) => {
                    debug!(
                        connection_id = handshake.connection_id,
                        server_version = %handshake.server_version,
                        "event connection authenticated"
                    );
                    let hook = {
                        let mut shared = self.shared.borrow_mut();
                        shared.connected = true;
                        shared.on_connect.take()
                    };
                    if let Some(hook) = hook {
                        hook(Ok(()));
                    }
                    self.pump();
                    self.maybe_freed();
                }
                Effect::Fields(fields) => self.deliver(QueryEvent::Fields(fields)),
                Effect::Row(row) => self.deliver(QueryEvent::Row(row)),
                Effect::Status(status) => self.deliver(QueryEvent::Status(status)),
                Effect::EndOfRows => self.deliver(QueryEvent::End),
                Effect::QueryError(error) | Effect::Rejected(error) => {
                    self.deliver(QueryEvent::Error(error));
                }
                Effect::ConnectionFailed(error) => self.failed(error),
                Effect::Release => {
                    self.shared.borrow_mut().current = None;
                    self.pump();
                    self.maybe_freed();
                }
            }
        }
    }

    fn write(&self, bytes: Vec<u8>) {
        let weak = self.downgrade();
        let mut shared = self.shared.borrow_mut();
        if shared.transport.is_closed() {
            return;
        }
        shared.transport.write(
            bytes,
            Box::new(move |result| {
                if let (Err(e), Some(conn)) = (result, Self::upgrade(&weak)) {
                    conn.received(Err(e));
                }
            }),
        );
    }

    /// Hand `event` to the command in flight.
    fn deliver(&self, event: QueryEvent) {
        let terminal = event.is_terminal();
        let (sink, sql) = {
            let mut shared = self.shared.borrow_mut();
            match shared.current.as_mut() {
                Some(pending) => (pending.sink.take(), pending.request.sql().to_string()),
                None => (None, String::new()),
            }
        };
        let Some(mut sink) = sink else {
            if !terminal {
                warn!("dropping result event with no command in flight");
            }
            return;
        };
        let event = match event {
            QueryEvent::Error(error) => QueryEvent::Error(error.with_sql(&sql)),
            other => other,
        };
        sink(event);
        if terminal {
            return;
        }
        let orphaned = {
            let mut shared = self.shared.borrow_mut();
            match shared.current.as_mut() {
                Some(pending) if pending.sink.is_none() => {
                    pending.sink = Some(sink);
                    None
                }
                _ => Some(sink),
            }
        };
        // Closed from inside the handler
        if let Some(mut sink) = orphaned {
            sink(QueryEvent::Error(Error::already_closed()));
        }
    }

    /// Write the next queued command if the connection is idle.
    fn pump(&self) {
        let effects = {
            let mut shared = self.shared.borrow_mut();
            if shared.closed
                || !shared.connected
                || shared.current.is_some()
                || !shared.machine.is_idle()
            {
                return;
            }
            let Some(next) = shared.queue.pop_front() else {
                return;
            };
            if shared.config.log_sql {
                let connection_id = shared.machine.handshake().map(|h| h.connection_id);
                match &next.request {
                    Request::Prepared { sql, params } => {
                        info!(target: "sqlwire::sql", ?connection_id, ?params, "{sql}");
                    }
                    request => info!(target: "sqlwire::sql", ?connection_id, "{}", request.sql()),
                }
            }
            let effects = shared.machine.send(next.request.clone());
            shared.current = Some(next);
            effects
        };
        self.apply(effects);
    }

    fn maybe_freed(&self) {
        let hook = {
            let mut shared = self.shared.borrow_mut();
            let free = shared.connected
                && !shared.closed
                && !shared.transacting
                && shared.current.is_none()
                && shared.queue.is_empty();
            if free { shared.on_freed.take() } else { None }
        };
        if let Some(mut hook) = hook {
            hook();
            let mut shared = self.shared.borrow_mut();
            if shared.on_freed.is_none() {
                shared.on_freed = Some(hook);
            }
        }
    }

    /// The connection is unusable: fail everything and report.
    fn failed(&self, error: Error) {
        let (current, queued, on_connect, on_error) = {
            let mut shared = self.shared.borrow_mut();
            let was_connected = mem::replace(&mut shared.connected, false);
            shared.closed = true;
            shared.transport.close();
            let current = shared.current.take().and_then(|pending| pending.sink);
            let queued: Vec<Pending> = shared.queue.drain(..).collect();
            let on_connect = if was_connected {
                None
            } else {
                shared.on_connect.take()
            };
            (current, queued, on_connect, shared.on_error.take())
        };
        warn!(error = %error, queued = queued.len(), "event connection failed");
        fail_all(current, queued, Error::already_closed);
        if let Some(mut hook) = on_error {
            hook(&error);
            let mut shared = self.shared.borrow_mut();
            if shared.on_error.is_none() {
                shared.on_error = Some(hook);
            }
        }
        if let Some(hook) = on_connect {
            hook(Err(error));
        }
    }
}

fn fail_all(current: Option<Sink>, queued: Vec<Pending>, error: impl Fn() -> Error) {
    let sinks = current
        .into_iter()
        .chain(queued.into_iter().filter_map(|pending| pending.sink));
    for mut sink in sinks {
        sink(QueryEvent::Error(error()));
    }
}

/// A sink that gathers a command's events into one [`QueryOutcome`].
fn collect(resolver: Resolver<Result<QueryOutcome>>) -> Sink {
    let mut resolver = Some(resolver);
    let mut fields = Vec::new();
    let mut rows = Vec::new();
    Box::new(move |event| {
        let outcome = match event {
            QueryEvent::Fields(f) => {
                fields = f;
                return;
            }
            QueryEvent::Row(row) => {
                rows.push(row);
                return;
            }
            QueryEvent::End => Ok(QueryOutcome::Rows {
                fields: mem::take(&mut fields),
                rows: mem::take(&mut rows),
            }),
            QueryEvent::Status(status) => Ok(QueryOutcome::Status(status)),
            QueryEvent::Error(error) => Err(error),
        };
        if let Some(resolver) = resolver.take() {
            resolver.resolve(outcome);
        }
    })
}
