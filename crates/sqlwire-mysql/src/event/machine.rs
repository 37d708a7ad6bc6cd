//! Sans-IO protocol state machine for the event-driven connection.
//!
//! Bytes are pushed in with [`Machine::receive`], which buffers them and runs
//! [`Machine::transition`] once for every complete packet, so one delivery may
//! advance through several states and a packet split over many deliveries
//! advances nothing until it is whole. The machine never touches a socket; it
//! returns [`Effect`]s for the connection to carry out.

use std::mem;

use asupersync::bytes::BytesMut;
use sqlwire_core::{ConnectionErrorKind, Error, Row, Value};
use tracing::{debug, trace, warn};

use crate::auth::{AuthStep, Authenticator, Handshake};
use crate::classify::classify;
use crate::config::MySqlConfig;
use crate::connection::QueryStatus;
use crate::protocol::{
    Command, Frame, PacketReader, PacketType, StmtPrepareOk, build_command_packet,
    build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet, is_eof_packet,
    parse_stmt_prepare_ok, split_packet,
};
use crate::rows::{RowDecoder, RowFormat};
use crate::types::Field;

/// A command the connection asks the machine to start.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query(String),
    Prepared { sql: String, params: Vec<Value> },
    InitDb(String),
    Ping,
}

impl Request {
    /// Statement text for logging and error context.
    pub fn sql(&self) -> &str {
        match self {
            Request::Query(sql) | Request::Prepared { sql, .. } => sql,
            Request::InitDb(_) => "COM_INIT_DB",
            Request::Ping => "COM_PING",
        }
    }
}

/// Where a prepared statement is in its prepare exchange.
#[derive(Debug)]
pub enum StmtStage {
    AwaitPrepareOk,
    Definitions {
        prepared: StmtPrepareOk,
        runs_left: usize,
    },
}

#[derive(Debug)]
pub enum State {
    BeforeAuthenticate,
    Authenticating,
    /// Logged in, nothing in flight.
    Authenticated,
    /// Command written; waiting for OK, error or a column count.
    StartQuerying {
        format: RowFormat,
        statement_id: Option<u32>,
    },
    StartStmt {
        params: Vec<Value>,
        stage: StmtStage,
    },
    ParsingColumns {
        remaining: usize,
        fields: Vec<Field>,
        format: RowFormat,
        statement_id: Option<u32>,
    },
    ParsingResultSet {
        decoder: Box<dyn RowDecoder>,
        statement_id: Option<u32>,
    },
    EndWithResultSet,
    EndWithQueryStatus,
    EndWithError,
    /// Terminal: authentication failed, the stream was lost or desynced.
    Closed,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::BeforeAuthenticate => "before_authenticate",
            State::Authenticating => "authenticating",
            State::Authenticated => "authenticated",
            State::StartQuerying { .. } => "start_querying",
            State::StartStmt { .. } => "start_stmt",
            State::ParsingColumns { .. } => "parsing_columns",
            State::ParsingResultSet { .. } => "parsing_result_set",
            State::EndWithResultSet => "end_with_result_set",
            State::EndWithQueryStatus => "end_with_query_status",
            State::EndWithError => "end_with_error",
            State::Closed => "closed",
        }
    }

    /// A new command may be written.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            State::Authenticated
                | State::EndWithResultSet
                | State::EndWithQueryStatus
                | State::EndWithError
        )
    }

    /// A command is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            State::StartQuerying { .. }
                | State::StartStmt { .. }
                | State::ParsingColumns { .. }
                | State::ParsingResultSet { .. }
        )
    }
}

#[derive(Debug)]
pub enum Event {
    /// One complete logical packet.
    Packet { payload: Vec<u8>, sequence_id: u8 },
    /// Start a command.
    Send(Request),
    /// The transport failed or the peer closed.
    Lost(Error),
}

#[derive(Debug)]
pub enum Effect {
    /// Write these framed bytes.
    Write(Vec<u8>),
    /// Authentication finished.
    Connected(Handshake),
    /// Column definitions of the current result set, once per set.
    Fields(Vec<Field>),
    Row(Row),
    Status(QueryStatus),
    /// The current result set ended normally.
    EndOfRows,
    /// The current command failed.
    QueryError(Error),
    /// A `Send` arrived while a command was in flight.
    Rejected(Error),
    /// The connection is unusable from now on.
    ConnectionFailed(Error),
    /// The current command is done; the next one may be written.
    Release,
}

impl Effect {
    /// Ends the current command's result.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Effect::Status(_) | Effect::EndOfRows | Effect::QueryError(_) | Effect::Rejected(_)
        )
    }
}

/// The protocol engine for one event-driven connection.
#[derive(Debug)]
pub struct Machine {
    state: State,
    auth: Authenticator,
    handshake: Option<Handshake>,
    buffer: BytesMut,
}

impl Machine {
    pub fn new(config: &MySqlConfig) -> Self {
        Self {
            state: State::BeforeAuthenticate,
            auth: Authenticator::new(config),
            handshake: None,
            buffer: BytesMut::with_capacity(config.read_buffer_size),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state.is_idle()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Bytes received but not yet part of a complete packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer `bytes` and transition once per complete packet.
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<Effect> {
        self.buffer.extend_from_slice(bytes);
        let mut effects = Vec::new();
        while !self.is_closed() {
            // A short frame is not an error: wait for the next delivery
            let Ok(Frame {
                sequence_id,
                payload,
                consumed,
            }) = split_packet(&self.buffer)
            else {
                break;
            };
            let _ = self.buffer.split_to(consumed);
            trace!(len = payload.len(), seq = sequence_id, "packet");
            effects.extend(self.step(Event::Packet {
                payload,
                sequence_id,
            }));
        }
        if self.is_closed() {
            self.buffer.clear();
        }
        effects
    }

    pub fn send(&mut self, request: Request) -> Vec<Effect> {
        self.step(Event::Send(request))
    }

    pub fn lost(&mut self, error: Error) -> Vec<Effect> {
        self.buffer.clear();
        self.step(Event::Lost(error))
    }

    fn step(&mut self, event: Event) -> Vec<Effect> {
        let state = mem::replace(&mut self.state, State::Closed);
        let from = state.name();
        let (next, effects) = self.transition(state, event);
        if from != next.name() {
            trace!(from, to = next.name(), "transition");
        }
        self.state = next;
        effects
    }

    /// The transition function.
    pub fn transition(&mut self, state: State, event: Event) -> (State, Vec<Effect>) {
        match event {
            Event::Lost(error) => Self::on_lost(state, error),
            Event::Send(request) => {
                if state.is_idle() {
                    Self::on_send(request)
                } else {
                    (state, vec![Effect::Rejected(Error::commands_out_of_sync())])
                }
            }
            Event::Packet {
                payload,
                sequence_id,
            } => self.on_packet(state, &payload, sequence_id),
        }
    }

    fn on_lost(state: State, error: Error) -> (State, Vec<Effect>) {
        let mut effects = Vec::new();
        if matches!(state, State::Closed) {
            return (State::Closed, effects);
        }
        if state.is_busy() {
            effects.push(Effect::QueryError(Error::connection(
                ConnectionErrorKind::Disconnected,
                format!("connection lost during query: {error}"),
            )));
        }
        debug!(state = state.name(), error = %error, "connection lost");
        effects.push(Effect::ConnectionFailed(error));
        (State::Closed, effects)
    }

    fn on_send(request: Request) -> (State, Vec<Effect>) {
        let text = |format| State::StartQuerying {
            format,
            statement_id: None,
        };
        match request {
            Request::Query(sql) => (
                text(RowFormat::Text),
                vec![Effect::Write(build_command_packet(Command::Query, sql.as_bytes()))],
            ),
            Request::Prepared { sql, params } => (
                State::StartStmt {
                    params,
                    stage: StmtStage::AwaitPrepareOk,
                },
                vec![Effect::Write(build_stmt_prepare_packet(&sql))],
            ),
            Request::InitDb(database) => (
                text(RowFormat::Text),
                vec![Effect::Write(build_command_packet(
                    Command::InitDb,
                    database.as_bytes(),
                ))],
            ),
            Request::Ping => (
                text(RowFormat::Text),
                vec![Effect::Write(build_command_packet(Command::Ping, &[]))],
            ),
        }
    }

    fn on_packet(&mut self, state: State, payload: &[u8], sequence_id: u8) -> (State, Vec<Effect>) {
        match state {
            State::BeforeAuthenticate => match self.auth.start(payload, sequence_id) {
                Ok(response) => (State::Authenticating, vec![Effect::Write(response)]),
                Err(e) => (State::Closed, vec![Effect::ConnectionFailed(e)]),
            },
            State::Authenticating => match self.auth.on_packet(payload, sequence_id) {
                Ok(AuthStep::Done(_)) => match self.auth.handshake().cloned() {
                    Some(handshake) => {
                        self.handshake = Some(handshake.clone());
                        (State::Authenticated, vec![Effect::Connected(handshake)])
                    }
                    None => (
                        State::Closed,
                        vec![Effect::ConnectionFailed(Error::connection(
                            ConnectionErrorKind::Handshake,
                            "authenticated without a handshake",
                        ))],
                    ),
                },
                Ok(AuthStep::Write(bytes)) => (State::Authenticating, vec![Effect::Write(bytes)]),
                Ok(AuthStep::Wait) => (State::Authenticating, Vec::new()),
                Err(e) => (State::Closed, vec![Effect::ConnectionFailed(e)]),
            },
            State::StartQuerying {
                format,
                statement_id,
            } => Self::on_first_response(payload, format, statement_id),
            State::StartStmt { params, stage } => Self::on_prepare(payload, params, stage),
            State::ParsingColumns {
                remaining,
                fields,
                format,
                statement_id,
            } => Self::on_column(payload, remaining, fields, format, statement_id),
            State::ParsingResultSet {
                mut decoder,
                statement_id,
            } => match decoder.parse(payload) {
                Ok(Some(row)) => (
                    State::ParsingResultSet {
                        decoder,
                        statement_id,
                    },
                    vec![Effect::Row(row)],
                ),
                Ok(None) => {
                    if decoder.has_more_results() {
                        warn!("server announced more results");
                        return desync(Error::commands_out_of_sync());
                    }
                    finish(State::EndWithResultSet, Effect::EndOfRows, statement_id)
                }
                Err(e) => fail_command(e, statement_id),
            },
            idle => {
                warn!(
                    state = idle.name(),
                    len = payload.len(),
                    "ignoring unexpected packet"
                );
                (idle, Vec::new())
            }
        }
    }

    fn on_first_response(
        payload: &[u8],
        format: RowFormat,
        statement_id: Option<u32>,
    ) -> (State, Vec<Effect>) {
        match PacketType::of(payload) {
            PacketType::Ok => match PacketReader::new(payload).parse_ok_packet() {
                Some(ok) => finish(
                    State::EndWithQueryStatus,
                    Effect::Status(QueryStatus::from(&ok)),
                    statement_id,
                ),
                None => desync(Error::protocol("malformed OK packet", Some(payload))),
            },
            PacketType::Error => fail_command(server_error(payload), statement_id),
            PacketType::LocalInfile => desync(Error::protocol(
                "LOCAL INFILE requests are not supported",
                Some(payload),
            )),
            PacketType::Eof | PacketType::Data => {
                let mut reader = PacketReader::new(payload);
                match reader.read_lenenc_int() {
                    Some(count) if count > 0 && reader.is_empty() => {
                        #[allow(clippy::cast_possible_truncation)]
                        let remaining = count as usize;
                        (
                            State::ParsingColumns {
                                remaining,
                                fields: Vec::with_capacity(remaining),
                                format,
                                statement_id,
                            },
                            Vec::new(),
                        )
                    }
                    _ => desync(Error::commands_out_of_sync()),
                }
            }
        }
    }

    fn on_column(
        payload: &[u8],
        remaining: usize,
        mut fields: Vec<Field>,
        format: RowFormat,
        statement_id: Option<u32>,
    ) -> (State, Vec<Effect>) {
        if remaining == 0 {
            if !is_eof_packet(payload) {
                return desync(Error::protocol(
                    "expected EOF after column definitions",
                    Some(payload),
                ));
            }
            let effects = vec![Effect::Fields(fields.clone())];
            return (
                State::ParsingResultSet {
                    decoder: format.decoder(fields),
                    statement_id,
                },
                effects,
            );
        }
        if PacketType::of(payload) == PacketType::Error {
            return fail_command(server_error(payload), statement_id);
        }
        match Field::parse(payload) {
            Ok(field) => {
                fields.push(field);
                (
                    State::ParsingColumns {
                        remaining: remaining - 1,
                        fields,
                        format,
                        statement_id,
                    },
                    Vec::new(),
                )
            }
            Err(e) => desync(e),
        }
    }

    fn on_prepare(payload: &[u8], params: Vec<Value>, stage: StmtStage) -> (State, Vec<Effect>) {
        match stage {
            StmtStage::AwaitPrepareOk => {
                if PacketType::of(payload) == PacketType::Error {
                    return fail_command(server_error(payload), None);
                }
                let Some(prepared) = parse_stmt_prepare_ok(payload) else {
                    return desync(Error::protocol("malformed prepare response", Some(payload)));
                };
                match prepared.definition_runs() {
                    0 => execute(prepared, params),
                    runs_left => (
                        State::StartStmt {
                            params,
                            stage: StmtStage::Definitions {
                                prepared,
                                runs_left,
                            },
                        },
                        Vec::new(),
                    ),
                }
            }
            StmtStage::Definitions {
                prepared,
                runs_left,
            } => {
                if PacketType::of(payload) == PacketType::Error {
                    return fail_command(server_error(payload), Some(prepared.statement_id));
                }
                if !is_eof_packet(payload) {
                    // Definitions are skipped; only the terminators matter
                    return (
                        State::StartStmt {
                            params,
                            stage: StmtStage::Definitions {
                                prepared,
                                runs_left,
                            },
                        },
                        Vec::new(),
                    );
                }
                match runs_left - 1 {
                    0 => execute(prepared, params),
                    runs_left => (
                        State::StartStmt {
                            params,
                            stage: StmtStage::Definitions {
                                prepared,
                                runs_left,
                            },
                        },
                        Vec::new(),
                    ),
                }
            }
        }
    }
}

fn server_error(payload: &[u8]) -> Error {
    classify(payload).unwrap_or_else(|| Error::protocol("malformed error packet", Some(payload)))
}

fn execute(prepared: StmtPrepareOk, params: Vec<Value>) -> (State, Vec<Effect>) {
    let expected = usize::from(prepared.num_params);
    if expected != params.len() {
        return finish(
            State::EndWithError,
            Effect::QueryError(Error::parameter_mismatch(expected, params.len())),
            Some(prepared.statement_id),
        );
    }
    (
        State::StartQuerying {
            format: RowFormat::Binary,
            statement_id: Some(prepared.statement_id),
        },
        vec![Effect::Write(build_stmt_execute_packet(
            prepared.statement_id,
            &params,
        ))],
    )
}

/// End the command with `outcome`, closing its statement if it had one.
fn finish(next: State, outcome: Effect, statement_id: Option<u32>) -> (State, Vec<Effect>) {
    let mut effects = vec![outcome];
    if let Some(id) = statement_id {
        effects.push(Effect::Write(build_stmt_close_packet(id)));
    }
    effects.push(Effect::Release);
    (next, effects)
}

/// Fail the command; fatal errors also fail the connection.
fn fail_command(error: Error, statement_id: Option<u32>) -> (State, Vec<Effect>) {
    if error.is_connection_fatal() {
        desync(error)
    } else {
        finish(State::EndWithError, Effect::QueryError(error), statement_id)
    }
}

/// The stream can no longer be interpreted.
fn desync(error: Error) -> (State, Vec<Effect>) {
    warn!(error = %error, "protocol state lost");
    (
        State::Closed,
        vec![
            Effect::QueryError(error),
            Effect::ConnectionFailed(Error::connection(
                ConnectionErrorKind::Disconnected,
                "protocol state lost; connection closed",
            )),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{
        eof_payload, err_payload, login_bytes, ok_payload, result_set,
    };
    use crate::protocol::frame_payload;
    use crate::types::FieldType;

    fn logged_in() -> Machine {
        let mut machine = Machine::new(&MySqlConfig::new().user("app"));
        let bytes = login_bytes();
        let greeting_len = 4 + usize::from(bytes[0]) + (usize::from(bytes[1]) << 8);
        let effects = machine.receive(&bytes[..greeting_len]);
        assert!(matches!(effects.as_slice(), [Effect::Write(_)]));
        let effects = machine.receive(&bytes[greeting_len..]);
        assert!(matches!(effects.as_slice(), [Effect::Connected(_)]));
        assert!(machine.is_idle());
        machine
    }

    fn rows_of(effects: &[Effect]) -> Vec<&Row> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Row(row) => Some(row),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_login_one_byte_at_a_time() {
        let mut machine = Machine::new(&MySqlConfig::new());
        let mut effects = Vec::new();
        for byte in login_bytes() {
            effects.extend(machine.receive(&[byte]));
        }
        assert!(matches!(
            effects.as_slice(),
            [Effect::Write(_), Effect::Connected(_)]
        ));
        assert_eq!(machine.state().name(), "authenticated");
        assert_eq!(machine.buffered(), 0);
    }

    #[test]
    fn test_malformed_greeting_fails_connection() {
        let mut machine = Machine::new(&MySqlConfig::new());
        let effects = machine.receive(&frame_payload(&[10, b'5'], 0));
        assert!(matches!(
            effects.as_slice(),
            [Effect::ConnectionFailed(Error::Connection(c))] if c.kind == ConnectionErrorKind::Handshake
        ));
        assert!(machine.is_closed());
    }

    #[test]
    fn test_result_set_in_one_delivery() {
        let mut machine = logged_in();
        let effects = machine.send(Request::Query("SELECT id, name FROM t".into()));
        assert!(matches!(effects.as_slice(), [Effect::Write(_)]));

        let fields = vec![
            Field::new("id", FieldType::Long),
            Field::new("name", FieldType::VarString),
        ];
        let effects = machine.receive(&result_set(
            &fields,
            &[vec![Some("1"), Some("a")], vec![Some("2"), Some("b")]],
        ));
        assert!(matches!(effects.first(), Some(Effect::Fields(f)) if f.len() == 2));
        assert_eq!(rows_of(&effects).len(), 2);
        assert!(matches!(
            &effects[effects.len() - 2..],
            [Effect::EndOfRows, Effect::Release]
        ));
        assert_eq!(machine.state().name(), "end_with_result_set");
    }

    #[test]
    fn test_partial_header_waits() {
        let mut machine = logged_in();
        machine.send(Request::Ping);
        let ok = frame_payload(&ok_payload(0, 0, 2), 1);
        assert!(machine.receive(&ok[..2]).is_empty());
        assert!(machine.receive(&ok[2..6]).is_empty());
        let effects = machine.receive(&ok[6..]);
        assert!(matches!(
            effects.as_slice(),
            [Effect::Status(_), Effect::Release]
        ));
    }

    #[test]
    fn test_send_while_busy_is_rejected() {
        let mut machine = logged_in();
        machine.send(Request::Query("SELECT 1".into()));
        let effects = machine.send(Request::Query("SELECT 2".into()));
        assert!(matches!(
            effects.as_slice(),
            [Effect::Rejected(e)] if e.is_client_error()
        ));
        assert_eq!(machine.state().name(), "start_querying");
    }

    #[test]
    fn test_server_error_keeps_machine_usable() {
        let mut machine = logged_in();
        machine.send(Request::Query("SELECT * FROM nope".into()));
        let effects = machine.receive(&frame_payload(&err_payload(1146, "42S02", "no table"), 1));
        assert!(matches!(
            effects.as_slice(),
            [Effect::QueryError(e), Effect::Release] if e.error_code() == Some(1146)
        ));
        assert!(machine.is_idle());
    }

    #[test]
    fn test_lost_mid_result_set() {
        let mut machine = logged_in();
        machine.send(Request::Query("SELECT 1".into()));
        machine.receive(&frame_payload(&[1], 1));
        let effects = machine.lost(Error::connection(ConnectionErrorKind::Disconnected, "eof"));
        assert!(matches!(
            effects.as_slice(),
            [Effect::QueryError(_), Effect::ConnectionFailed(_)]
        ));
        assert!(machine.is_closed());
        assert!(machine.receive(&eof_payload()).is_empty());
    }

    #[test]
    fn test_prepared_flow() {
        let mut machine = logged_in();
        let effects = machine.send(Request::Prepared {
            sql: "DELETE FROM t WHERE id = ?".into(),
            params: vec![Value::Int(5)],
        });
        assert!(matches!(effects.as_slice(), [Effect::Write(w)] if w[4] == Command::StmtPrepare as u8));

        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&9u32.to_le_bytes());
        prepare_ok.extend_from_slice(&0u16.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0]);
        let mut bytes = frame_payload(&prepare_ok, 1);
        bytes.extend_from_slice(&frame_payload(
            &crate::mock::column_definition(&Field::new("?", FieldType::Long)),
            2,
        ));
        bytes.extend_from_slice(&frame_payload(&eof_payload(), 3));
        let effects = machine.receive(&bytes);
        assert!(matches!(effects.as_slice(), [Effect::Write(w)] if w[4] == Command::StmtExecute as u8));

        let effects = machine.receive(&frame_payload(&ok_payload(1, 0, 2), 1));
        assert!(matches!(
            effects.as_slice(),
            [Effect::Status(s), Effect::Write(close), Effect::Release]
                if s.affected_rows == 1 && *close == build_stmt_close_packet(9)
        ));
    }

    #[test]
    fn test_prepared_error_among_definitions() {
        let mut machine = logged_in();
        machine.send(Request::Prepared {
            sql: "SELECT * FROM t WHERE id = ?".into(),
            params: vec![Value::Int(5)],
        });
        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&6u32.to_le_bytes());
        prepare_ok.extend_from_slice(&0u16.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0]);
        let mut bytes = frame_payload(&prepare_ok, 1);
        bytes.extend_from_slice(&frame_payload(
            &err_payload(1105, "HY000", "definition lost"),
            2,
        ));
        let effects = machine.receive(&bytes);
        assert!(matches!(
            effects.as_slice(),
            [Effect::QueryError(e), Effect::Write(close), Effect::Release]
                if e.error_code() == Some(1105) && *close == build_stmt_close_packet(6)
        ));
        assert!(machine.is_idle());
    }

    #[test]
    fn test_prepared_parameter_mismatch() {
        let mut machine = logged_in();
        machine.send(Request::Prepared {
            sql: "SELECT 1".into(),
            params: vec![Value::Int(5)],
        });
        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&4u32.to_le_bytes());
        prepare_ok.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0]);
        let effects = machine.receive(&frame_payload(&prepare_ok, 1));
        assert!(matches!(
            effects.as_slice(),
            [Effect::QueryError(e), Effect::Write(_), Effect::Release] if e.is_client_error()
        ));
        assert!(machine.is_idle());
    }
}
