//! Blocking MySQL connection.
//!
//! A [`MySqlConnection`] performs the handshake on construction and then
//! runs one command at a time. Plain queries return a [`QueryResult`]: either
//! a [`QueryStatus`] or a lazily read [`ResultSet`]. Statements with bound
//! parameters go through `COM_STMT_PREPARE` / `COM_STMT_EXECUTE` and decode
//! rows with the binary protocol.
//!
//! The connection is `Sync`. Only one command may be in flight: a second
//! command issued while a result set is still being read (or while another
//! thread is mid round trip) fails with "commands out of sync" instead of
//! blocking. Callers that need to wait for exclusive use go through
//! [`reserve`](MySqlConnection::reserve).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use sqlwire_core::{ConnectionErrorKind, Error, PoolError, PoolErrorKind, Result, Row, Value};
use tracing::{debug, info, warn};

use crate::auth::{AuthStep, Authenticator, Handshake};
use crate::classify::classify;
use crate::config::MySqlConfig;
use crate::protocol::{
    Command, OkPacket, PacketReader, PacketType, StmtPrepareOk, build_command_packet,
    build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet, is_eof_packet,
    parse_stmt_prepare_ok, server_status,
};
use crate::rows::{RowDecoder, RowFormat};
use crate::transport::{PacketStream, TcpTransport, Transport};
use crate::types::Field;

/// Terminal result of a command that returned no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStatus {
    pub affected_rows: u64,
    pub insert_id: u64,
    pub warnings: u16,
    pub status_flags: u16,
}

impl From<&OkPacket> for QueryStatus {
    fn from(ok: &OkPacket) -> Self {
        Self {
            affected_rows: ok.affected_rows,
            insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            status_flags: ok.status_flags,
        }
    }
}

/// Outcome of [`MySqlConnection::query`].
#[derive(Debug)]
pub enum QueryResult<'c, T: Transport = TcpTransport> {
    Status(QueryStatus),
    ResultSet(ResultSet<'c, T>),
}

impl<T: Transport> QueryResult<'_, T> {
    pub fn is_result_set(&self) -> bool {
        matches!(self, QueryResult::ResultSet(_))
    }

    /// The status, or `None` for a result set.
    pub fn status(&self) -> Option<QueryStatus> {
        match self {
            QueryResult::Status(status) => Some(*status),
            QueryResult::ResultSet(_) => None,
        }
    }

    /// Read every row. A status result yields no rows.
    pub fn rows(self) -> Result<Vec<Row>> {
        match self {
            QueryResult::Status(_) => Ok(Vec::new()),
            QueryResult::ResultSet(set) => set.collect_rows(),
        }
    }
}

struct Inner<T> {
    stream: PacketStream<T>,
    in_flight: bool,
    closed: bool,
    broken: bool,
    status_flags: u16,
}

impl<T: Transport> Inner<T> {
    fn ready(&self) -> Result<()> {
        if self.closed {
            return Err(Error::already_closed());
        }
        if self.broken {
            return Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection is broken",
            ));
        }
        if self.in_flight {
            return Err(Error::commands_out_of_sync());
        }
        Ok(())
    }

    /// Run `f`, marking the connection broken if it fails fatally.
    fn guarded<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let result = f(self);
        if matches!(&result, Err(e) if e.is_connection_fatal()) {
            self.broken = true;
            self.in_flight = false;
        }
        result
    }

    fn command(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        self.stream.write(packet)?;
        Ok(self.stream.read_packet()?.0)
    }

    fn prepare(&mut self, sql: &str) -> Result<StmtPrepareOk> {
        let payload = self.command(&build_stmt_prepare_packet(sql))?;
        if let Some(err) = classify(&payload) {
            return Err(err);
        }
        let prepared = parse_stmt_prepare_ok(&payload)
            .ok_or_else(|| Error::protocol("malformed prepare response", Some(&payload)))?;
        // Parameter and column definitions are not needed to execute
        for _ in 0..prepared.definition_runs() {
            if let Err(e) = self.stream.skip_until_eof() {
                if !e.is_connection_fatal() {
                    if let Err(close) = self.close_statement(Some(prepared.statement_id)) {
                        debug!(error = %close, "failed to close prepared statement");
                    }
                }
                return Err(e);
            }
        }
        Ok(prepared)
    }

    fn read_fields(&mut self, count: usize) -> Result<Vec<Field>> {
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let (payload, _) = self.stream.read_packet()?;
            if let Some(err) = classify(&payload) {
                return Err(err);
            }
            fields.push(Field::parse(&payload)?);
        }
        let (payload, _) = self.stream.read_packet()?;
        if !is_eof_packet(&payload) {
            return Err(Error::protocol(
                "expected EOF after column definitions",
                Some(&payload),
            ));
        }
        Ok(fields)
    }

    fn close_statement(&mut self, statement_id: Option<u32>) -> Result<()> {
        match statement_id {
            Some(id) if !self.broken => self.stream.write(&build_stmt_close_packet(id)),
            _ => Ok(()),
        }
    }
}

/// A blocking connection to a MySQL server.
pub struct MySqlConnection<T: Transport = TcpTransport> {
    config: MySqlConfig,
    handshake: Handshake,
    inner: Mutex<Inner<T>>,
    reserved: Mutex<bool>,
    available: Condvar,
    transacting: AtomicBool,
}

impl<T: Transport> std::fmt::Debug for MySqlConnection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("connection_id", &self.handshake.connection_id)
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("database", &self.config.database)
            .field("transacting", &self.is_transacting())
            .finish_non_exhaustive()
    }
}

impl MySqlConnection<TcpTransport> {
    /// Connect over TCP and authenticate.
    #[tracing::instrument(level = "debug", skip(config), fields(host = %config.host, port = config.port))]
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        let transport = TcpTransport::from_config(&config);
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> MySqlConnection<T> {
    /// Open `transport` and run the connection phase over it.
    ///
    /// A truncated or malformed greeting fails with a `Handshake` connection
    /// error; the transport is closed on any failure.
    pub fn with_transport(mut transport: T, config: MySqlConfig) -> Result<Self> {
        transport.open().map_err(|e| {
            Error::Connection(sqlwire_core::ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("failed to connect to {}: {e}", config.socket_addr()),
                source: Some(Box::new(e)),
            })
        })?;

        let mut stream = PacketStream::new(transport, config.read_buffer_size);
        let (handshake, ok) = match authenticate(&mut stream, &config) {
            Ok(done) => done,
            Err(e) => {
                stream.close();
                return Err(e);
            }
        };
        debug!(
            connection_id = handshake.connection_id,
            server_version = %handshake.server_version,
            "connection ready"
        );

        Ok(Self {
            config,
            handshake,
            inner: Mutex::new(Inner {
                stream,
                in_flight: false,
                closed: false,
                broken: false,
                status_flags: ok.status_flags,
            }),
            reserved: Mutex::new(false),
            available: Condvar::new(),
            transacting: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn connection_id(&self) -> u32 {
        self.handshake.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.handshake.server_version
    }

    /// Run a text-protocol query.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn query(&self, sql: &str) -> Result<QueryResult<'_, T>> {
        let mut inner = self.begin_command()?;
        self.log_sql(sql, &[]);
        let payload = inner
            .guarded(|inner| inner.command(&build_command_packet(Command::Query, sql.as_bytes())))?;
        self.read_results(inner, &payload, RowFormat::Text, None, sql)
    }

    /// Prepare `sql`, bind `params` and execute it.
    ///
    /// The statement is closed on the server once its result is consumed.
    #[tracing::instrument(level = "debug", skip(self, params), fields(params = params.len()))]
    pub fn query_with_params(&self, sql: &str, params: &[Value]) -> Result<QueryResult<'_, T>> {
        let mut inner = self.begin_command()?;
        self.log_sql(sql, params);
        let prepared = inner
            .guarded(|inner| inner.prepare(sql))
            .map_err(|e| e.with_sql(sql))?;

        let statement_id = prepared.statement_id;
        if usize::from(prepared.num_params) != params.len() {
            inner.guarded(|inner| inner.close_statement(Some(statement_id)))?;
            return Err(Error::parameter_mismatch(
                usize::from(prepared.num_params),
                params.len(),
            ));
        }

        let payload = inner.guarded(|inner| {
            inner.command(&build_stmt_execute_packet(statement_id, params))
        })?;
        self.read_results(inner, &payload, RowFormat::Binary, Some(statement_id), sql)
    }

    /// Run a statement and return its status, discarding any rows.
    pub fn execute(&self, sql: &str) -> Result<QueryStatus> {
        match self.query(sql)? {
            QueryResult::Status(status) => Ok(status),
            QueryResult::ResultSet(set) => {
                set.collect_rows()?;
                Ok(QueryStatus::default())
            }
        }
    }

    /// Switch the default database (`COM_INIT_DB`).
    pub fn use_database(&self, database: &str) -> Result<QueryStatus> {
        debug!(database, "use database");
        self.simple_command(Command::InitDb, database.as_bytes())
    }

    /// Check that the server is alive (`COM_PING`).
    pub fn ping(&self) -> Result<()> {
        self.simple_command(Command::Ping, &[]).map(|_| ())
    }

    /// Send `COM_QUIT` and close the transport.
    ///
    /// Later commands, and a second `close`, fail with "already closed".
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner();
        if inner.closed {
            return Err(Error::already_closed());
        }
        if !inner.broken {
            // No reply to COM_QUIT; failures here are irrelevant
            let _ = inner.stream.write(&build_command_packet(Command::Quit, &[]));
        }
        inner.stream.close();
        inner.closed = true;
        inner.in_flight = false;
        drop(inner);
        debug!(connection_id = self.connection_id(), "connection closed");
        self.available.notify_all();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.inner();
        inner.closed || inner.stream.is_closed()
    }

    /// Whether a fatal error left the connection unusable.
    pub fn is_broken(&self) -> bool {
        self.inner().broken
    }

    /// Usable for a new command right now. Never waits: a command in
    /// progress holds the connection, so a busy connection reports `false`.
    pub fn is_usable(&self) -> bool {
        let inner = match self.inner.try_lock() {
            Ok(inner) => inner,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        inner.ready().is_ok() && !inner.stream.is_closed()
    }

    /// Whether the server reports an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.inner().status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    /// Whether a transaction was started through this connection.
    pub fn is_transacting(&self) -> bool {
        self.transacting.load(Ordering::Acquire)
    }

    pub(crate) fn set_transacting(&self, transacting: bool) {
        self.transacting.store(transacting, Ordering::Release);
    }

    /// Claim the connection if nobody holds it.
    pub fn try_reserve(&self) -> bool {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if *reserved {
            false
        } else {
            *reserved = true;
            true
        }
    }

    /// Claim the connection, waiting up to `timeout` for the holder to release it.
    pub fn reserve(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        while *reserved {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Timeout,
                    message: format!("connection not released within {timeout:?}"),
                    source: None,
                }));
            }
            reserved = self
                .available
                .wait_timeout(reserved, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *reserved = true;
        Ok(())
    }

    /// Give the connection back and wake one waiter.
    pub fn release(&self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        *reserved = false;
        drop(reserved);
        self.available.notify_one();
    }

    pub fn is_reserved(&self) -> bool {
        *self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inner(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for a new command, failing instead of waiting if one is running.
    fn begin_command(&self) -> Result<MutexGuard<'_, Inner<T>>> {
        let inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(Error::commands_out_of_sync()),
        };
        inner.ready()?;
        Ok(inner)
    }

    fn log_sql(&self, sql: &str, params: &[Value]) {
        if !self.config.log_sql {
            return;
        }
        if params.is_empty() {
            info!(target: "sqlwire::sql", connection_id = self.connection_id(), "{sql}");
        } else {
            info!(target: "sqlwire::sql", connection_id = self.connection_id(), ?params, "{sql}");
        }
    }

    fn simple_command(&self, command: Command, payload: &[u8]) -> Result<QueryStatus> {
        let mut inner = self.begin_command()?;
        inner.guarded(|inner| {
            let response = inner.command(&build_command_packet(command, payload))?;
            if let Some(err) = classify(&response) {
                return Err(err);
            }
            let ok = PacketReader::new(&response)
                .parse_ok_packet()
                .filter(|_| PacketType::of(&response) == PacketType::Ok)
                .ok_or_else(|| Error::protocol("expected OK packet", Some(&response)))?;
            inner.status_flags = ok.status_flags;
            Ok(QueryStatus::from(&ok))
        })
    }

    /// Interpret the first response packet of a query or execute.
    fn read_results<'c>(
        &'c self,
        mut inner: MutexGuard<'c, Inner<T>>,
        payload: &[u8],
        format: RowFormat,
        statement_id: Option<u32>,
        sql: &str,
    ) -> Result<QueryResult<'c, T>> {
        match PacketType::of(payload) {
            PacketType::Ok => inner.guarded(|inner| {
                let ok = PacketReader::new(payload)
                    .parse_ok_packet()
                    .ok_or_else(|| Error::protocol("malformed OK packet", Some(payload)))?;
                inner.status_flags = ok.status_flags;
                inner.close_statement(statement_id)?;
                Ok(QueryResult::Status(QueryStatus::from(&ok)))
            }),
            PacketType::Error => {
                let err = classify(payload)
                    .unwrap_or_else(|| Error::protocol("malformed error packet", Some(payload)));
                inner.guarded(|inner| inner.close_statement(statement_id))?;
                Err(err.with_sql(sql))
            }
            PacketType::LocalInfile => {
                inner.broken = true;
                Err(Error::protocol(
                    "LOCAL INFILE requests are not supported",
                    Some(payload),
                ))
            }
            PacketType::Eof | PacketType::Data => {
                let mut reader = PacketReader::new(payload);
                match reader.read_lenenc_int() {
                    Some(count) if count > 0 && reader.is_empty() => {
                        inner.in_flight = true;
                        drop(inner);
                        #[allow(clippy::cast_possible_truncation)]
                        let column_count = count as usize;
                        Ok(QueryResult::ResultSet(ResultSet {
                            conn: self,
                            sql: sql.to_string(),
                            column_count,
                            format,
                            statement_id,
                            decoder: None,
                            finished: false,
                        }))
                    }
                    _ => {
                        warn!(len = payload.len(), "unexpected first response packet");
                        inner.broken = true;
                        Err(Error::commands_out_of_sync())
                    }
                }
            }
        }
    }
}

fn authenticate<T: Transport>(
    stream: &mut PacketStream<T>,
    config: &MySqlConfig,
) -> Result<(Handshake, OkPacket)> {
    let mut auth = Authenticator::new(config);
    let (greeting, sequence_id) = stream.read_packet()?;
    let response = auth.start(&greeting, sequence_id)?;
    stream.write(&response)?;

    let ok = loop {
        let (payload, sequence_id) = stream.read_packet()?;
        match auth.on_packet(&payload, sequence_id)? {
            AuthStep::Done(ok) => break ok,
            AuthStep::Write(bytes) => stream.write(&bytes)?,
            AuthStep::Wait => {}
        }
    };
    let handshake = auth
        .handshake()
        .cloned()
        .ok_or_else(|| Error::connection(ConnectionErrorKind::Handshake, "no handshake received"))?;
    Ok((handshake, ok))
}

/// Rows of one result set, read from the connection on demand.
///
/// Column definitions are read on the first call to [`fields`](Self::fields)
/// or the first pull. Dropping an unfinished set drains the remaining rows so
/// the connection can run the next command. If the connection is lost
/// mid-set, the iterator yields one `Disconnected` error and then ends.
pub struct ResultSet<'c, T: Transport = TcpTransport> {
    conn: &'c MySqlConnection<T>,
    sql: String,
    column_count: usize,
    format: RowFormat,
    statement_id: Option<u32>,
    decoder: Option<Box<dyn RowDecoder>>,
    finished: bool,
}

impl<T: Transport> std::fmt::Debug for ResultSet<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("column_count", &self.column_count)
            .field("format", &self.format)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> ResultSet<'_, T> {
    pub fn column_count(&self) -> usize {
        self.column_count
    }

    /// Column definitions, read from the wire on first use.
    pub fn fields(&mut self) -> Result<&[Field]> {
        self.ensure_fields()?;
        Ok(match &self.decoder {
            Some(decoder) => decoder.fields(),
            None => &[],
        })
    }

    /// Read every remaining row.
    pub fn collect_rows(mut self) -> Result<Vec<Row>> {
        self.by_ref().collect()
    }

    /// Read every remaining row as a column name -> value map.
    pub fn into_maps(self) -> Result<Vec<HashMap<String, Value>>> {
        Ok(self.collect_rows()?.iter().map(Row::to_map).collect())
    }

    fn ensure_fields(&mut self) -> Result<()> {
        if self.decoder.is_some() || self.finished {
            return Ok(());
        }
        let conn = self.conn;
        let mut inner = conn.inner();
        let count = self.column_count;
        match inner.guarded(|inner| inner.read_fields(count)) {
            Ok(fields) => {
                self.decoder = Some(self.format.decoder(fields));
                Ok(())
            }
            Err(e) => {
                self.finish(&mut inner);
                Err(e.with_sql(&self.sql))
            }
        }
    }

    fn finish(&mut self, inner: &mut Inner<T>) {
        self.finished = true;
        inner.in_flight = false;
        let statement_id = self.statement_id.take();
        if let Err(e) = inner.guarded(|inner| inner.close_statement(statement_id)) {
            debug!(
                statement_id = ?statement_id,
                error = %e,
                "failed to close prepared statement"
            );
        }
    }
}

impl<T: Transport> Iterator for ResultSet<'_, T> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.ensure_fields() {
            return Some(Err(e));
        }
        if self.finished {
            return None;
        }

        let conn = self.conn;
        let mut inner = conn.inner();
        let decoder = self.decoder.as_mut()?;
        let step = inner.guarded(|inner| {
            let (payload, _) = inner.stream.read_packet()?;
            decoder.parse(&payload)
        });
        match step {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                if decoder.has_more_results() {
                    // Multiple result sets are not requested; treat as desync
                    warn!("server announced more results");
                    inner.broken = true;
                }
                self.finish(&mut inner);
                None
            }
            Err(e) => {
                self.finish(&mut inner);
                Some(Err(e.with_sql(&self.sql)))
            }
        }
    }
}

impl<T: Transport> Drop for ResultSet<'_, T> {
    fn drop(&mut self) {
        while !self.finished {
            if self.next().is_none() {
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mock::column_definition;
    use crate::protocol::frame_payload;
    use crate::types::{FieldType, column_flags};
    use sqlwire_core::{ClientError, ClientErrorKind};
    use std::sync::Arc;

    pub(crate) use crate::mock::{
        ScriptedTransport as Scripted, eof_payload, err_payload, frame_all, login_bytes,
        ok_payload, result_set, text_row,
    };

    fn connect(transport: &Scripted) -> MySqlConnection<Scripted> {
        transport.push(login_bytes());
        let conn = MySqlConnection::with_transport(
            transport.clone(),
            MySqlConfig::new().user("root").password("secret"),
        )
        .unwrap();
        transport.take_written();
        conn
    }

    fn users() -> Vec<Field> {
        vec![
            Field::new("id", FieldType::Long).with_flags(column_flags::NOT_NULL),
            Field::new("name", FieldType::VarString),
        ]
    }

    #[test]
    fn test_connect_sends_auth_response() {
        let transport = Scripted::default();
        transport.push(login_bytes());
        let conn = MySqlConnection::with_transport(
            transport.clone(),
            MySqlConfig::new().user("root").password("secret"),
        )
        .unwrap();
        assert_eq!(conn.connection_id(), 42);
        assert_eq!(conn.server_version(), "8.0.36");

        let written = transport.take_written();
        // Handshake response is sequence 1
        assert_eq!(written[3], 1);
        assert!(written.windows(5).any(|w| w == b"root\0"));
    }

    #[test]
    fn test_truncated_handshake_fails_fast() {
        let transport = Scripted::default();
        transport.push(frame_payload(&[10, b'8', b'.'], 0));
        let err = MySqlConnection::with_transport(transport.clone(), MySqlConfig::new())
            .unwrap_err();
        assert!(err.is_connection_fatal());
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Handshake
        ));
    }

    #[test]
    fn test_server_closes_during_handshake() {
        let transport = Scripted::default();
        transport.push(vec![0x4A, 0x00]);
        let err = MySqlConnection::with_transport(transport, MySqlConfig::new()).unwrap_err();
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_query_status() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        transport.push(frame_payload(&ok_payload(3, 17, 2), 1));

        let result = conn.query("UPDATE t SET a = 1").unwrap();
        let status = result.status().unwrap();
        assert_eq!(status.affected_rows, 3);
        assert_eq!(status.insert_id, 17);

        let written = transport.take_written();
        assert_eq!(written[3], 0);
        assert_eq!(written[4], Command::Query as u8);
        assert_eq!(&written[5..], b"UPDATE t SET a = 1");
    }

    #[test]
    fn test_query_rows() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        transport.push(result_set(
            &users(),
            &[
                vec![Some("1"), Some("alice")],
                vec![Some("2"), None],
            ],
        ));

        let QueryResult::ResultSet(mut set) = conn.query("SELECT id, name FROM users").unwrap()
        else {
            panic!("expected a result set");
        };
        assert_eq!(set.fields().unwrap().len(), 2);
        let rows = set.collect_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_by_name("id"), Some(&Value::Int(1)));
        assert_eq!(rows[0].get_by_name("name"), Some(&Value::Text("alice".into())));
        assert_eq!(rows[1].get(1), Some(&Value::Null));
        assert!(conn.is_usable());
    }

    #[test]
    fn test_empty_result_set() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        transport.push(result_set(&users(), &[]));

        let rows = conn.query("SELECT id, name FROM users WHERE 0").unwrap().rows().unwrap();
        assert!(rows.is_empty());
        assert!(conn.is_usable());
    }

    #[test]
    fn test_second_command_while_reading_is_out_of_sync() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        transport.push(result_set(&users(), &[vec![Some("1"), Some("a")]]));

        let QueryResult::ResultSet(mut set) = conn.query("SELECT 1").unwrap() else {
            panic!("expected a result set");
        };
        assert!(set.next().unwrap().is_ok());

        let err = conn.query("SELECT 2").unwrap_err();
        assert!(matches!(
            err,
            Error::Client(ClientError {
                kind: ClientErrorKind::CommandsOutOfSync,
                ..
            })
        ));

        assert!(set.next().is_none());
        drop(set);
        transport.push(frame_payload(&ok_payload(0, 0, 2), 1));
        assert!(conn.query("DO 1").is_ok());
    }

    #[test]
    fn test_dropping_result_set_drains_rows() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        transport.push(result_set(
            &users(),
            &[vec![Some("1"), Some("a")], vec![Some("2"), Some("b")]],
        ));
        drop(conn.query("SELECT id, name FROM users").unwrap());

        transport.push(frame_payload(&ok_payload(1, 0, 2), 1));
        assert_eq!(conn.execute("DELETE FROM users").unwrap().affected_rows, 1);
    }

    #[test]
    fn test_server_error_keeps_connection() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        transport.push(frame_payload(
            &err_payload(1146, "42S02", "Table 'db.nope' doesn't exist"),
            1,
        ));

        let err = conn.query("SELECT * FROM nope").unwrap_err();
        assert!(err.is_server_error());
        assert_eq!(err.sql(), Some("SELECT * FROM nope"));
        assert!(conn.is_usable());
    }

    #[test]
    fn test_disconnect_mid_result_set() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        let mut payloads = vec![vec![2]];
        payloads.extend(users().iter().map(column_definition));
        payloads.push(eof_payload());
        payloads.push(text_row(&[Some("1"), Some("a")]));
        transport.push(frame_all(payloads, 1));

        let QueryResult::ResultSet(mut set) = conn.query("SELECT id, name FROM users").unwrap()
        else {
            panic!("expected a result set");
        };
        assert!(set.next().unwrap().is_ok());
        let err = set.next().unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Disconnected
        ));
        assert!(set.next().is_none());
        drop(set);
        assert!(conn.is_broken());
        assert!(conn.query("SELECT 1").is_err());
    }

    #[test]
    fn test_zero_column_count_is_out_of_sync() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        transport.push(frame_payload(&[0x05, 0x01], 1));
        let err = conn.query("SELECT 1").unwrap_err();
        assert!(err.is_client_error());
        assert!(conn.is_broken());
    }

    #[test]
    fn test_prepared_query() {
        let transport = Scripted::default();
        let conn = connect(&transport);

        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&7u32.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0]);
        let param = Field::new("?", FieldType::LongLong);
        let column = Field::new("id", FieldType::LongLong);
        transport.push(frame_all(
            vec![
                prepare_ok,
                column_definition(&param),
                eof_payload(),
                column_definition(&column),
                eof_payload(),
            ],
            1,
        ));

        let mut row = vec![0x00, 0x00];
        row.extend_from_slice(&42i64.to_le_bytes());
        transport.push(frame_all(
            vec![vec![1], column_definition(&column), eof_payload(), row, eof_payload()],
            1,
        ));

        let rows = conn
            .query_with_params("SELECT id FROM t WHERE id = ?", &[Value::BigInt(42)])
            .unwrap()
            .rows()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(42)));

        let written = transport.take_written();
        assert_eq!(written[4], Command::StmtPrepare as u8);
        // COM_STMT_CLOSE for statement 7 is the last packet written
        assert_eq!(&written[written.len() - 9..], &build_stmt_close_packet(7)[..]);
    }

    #[test]
    fn test_failed_statement_close_breaks_connection() {
        let transport = Scripted::default();
        let conn = connect(&transport);

        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&8u32.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes());
        prepare_ok.extend_from_slice(&0u16.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0]);
        let column = Field::new("id", FieldType::LongLong);
        transport.push(frame_all(
            vec![prepare_ok, column_definition(&column), eof_payload()],
            1,
        ));
        let mut row = vec![0x00, 0x00];
        row.extend_from_slice(&5i64.to_le_bytes());
        transport.push(frame_all(
            vec![vec![1], column_definition(&column), eof_payload(), row, eof_payload()],
            1,
        ));

        let result = conn.query_with_params("SELECT 5", &[]).unwrap();
        transport.refuse_writes();
        let rows = result.rows().unwrap();
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(5)));
        assert!(conn.is_broken());
        assert!(!conn.is_usable());
        assert!(conn.ping().is_err());
    }

    #[test]
    fn test_prepared_parameter_mismatch() {
        let transport = Scripted::default();
        let conn = connect(&transport);

        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&3u32.to_le_bytes());
        prepare_ok.extend_from_slice(&0u16.to_le_bytes());
        prepare_ok.extend_from_slice(&2u16.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0]);
        let param = Field::new("?", FieldType::LongLong);
        transport.push(frame_all(
            vec![
                prepare_ok,
                column_definition(&param),
                column_definition(&param),
                eof_payload(),
            ],
            1,
        ));

        let err = conn
            .query_with_params("UPDATE t SET a = ? WHERE b = ?", &[Value::Int(1)])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Client(ClientError {
                kind: ClientErrorKind::ParameterMismatch,
                ..
            })
        ));
        assert!(conn.is_usable());
    }

    #[test]
    fn test_use_database_and_ping() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        transport.push(frame_payload(&ok_payload(0, 0, 2), 1));
        conn.use_database("shop").unwrap();
        let written = transport.take_written();
        assert_eq!(written[4], Command::InitDb as u8);
        assert_eq!(&written[5..], b"shop");

        transport.push(frame_payload(&ok_payload(0, 0, 2), 1));
        conn.ping().unwrap();
        assert_eq!(transport.take_written()[4], Command::Ping as u8);
    }

    #[test]
    fn test_close_twice() {
        let transport = Scripted::default();
        let conn = connect(&transport);
        conn.close().unwrap();
        assert_eq!(transport.take_written(), build_command_packet(Command::Quit, &[]));
        assert!(conn.is_closed());

        let err = conn.close().unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Closed
        ));
        assert!(conn.query("SELECT 1").is_err());
    }

    #[test]
    fn test_reserve_release() {
        let transport = Scripted::default();
        let conn = Arc::new(connect(&transport));
        assert!(conn.try_reserve());
        assert!(!conn.try_reserve());
        assert!(conn.reserve(Duration::from_millis(10)).is_err());

        let other = Arc::clone(&conn);
        let waiter = std::thread::spawn(move || other.reserve(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        conn.release();
        assert!(waiter.join().unwrap().is_ok());
        assert!(conn.is_reserved());
    }
}
