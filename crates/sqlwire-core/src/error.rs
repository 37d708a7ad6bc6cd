//! Error types for sqlwire operations.
//!
//! The taxonomy mirrors who is to blame for a failure:
//!
//! - [`Error::Server`]: the server rejected the command (wire error packet with a
//!   code of 2000 or less). The connection stays usable.
//! - [`Error::Client`]: the client detected protocol misuse (code above 2000, for
//!   example "commands out of sync"). The command fails; the connection is reusable
//!   unless the framing itself is corrupt.
//! - [`Error::Io`], [`Error::Connection`] and [`Error::Protocol`]: transport or framing
//!   failures. These are fatal to the connection.

use std::fmt;

/// Error code reported when a command is issued while another is still in flight.
pub const CR_COMMANDS_OUT_OF_SYNC: u16 = 2014;

/// Client error code for a bound parameter count that does not match.
pub const CR_INVALID_PARAMETER_NO: u16 = 2034;

/// Message that accompanies [`CR_COMMANDS_OUT_OF_SYNC`].
pub const COMMANDS_OUT_OF_SYNC_MESSAGE: &str =
    "Commands out of sync; you can't run this command now";

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection lifecycle errors (connect, handshake, auth, disconnect)
    Connection(ConnectionError),
    /// Error packet sent by the server (code <= 2000)
    Server(ServerError),
    /// Locally detected protocol misuse (code > 2000)
    Client(ClientError),
    /// Malformed packet on the wire
    Protocol(ProtocolError),
    /// Value conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors from the transport
    Io(std::io::Error),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish the transport
    Connect,
    /// Handshake packet was truncated or malformed
    Handshake,
    /// Authentication failed
    Authentication,
    /// Connection lost during an operation
    Disconnected,
    /// Connection was closed by the caller
    Closed,
}

/// An error packet returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub sql_state: Option<String>,
    pub message: String,
    pub sql: Option<String>,
}

/// A client-side protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// A command was issued while another one was still in flight
    CommandsOutOfSync,
    /// Bound parameters do not match the statement
    ParameterMismatch,
    /// Any other client error code reported in an error packet
    Other,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open on this connection
    AlreadyStarted,
    /// COMMIT/ROLLBACK without an open transaction
    NotStarted,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No connection could be handed out
    Exhausted,
    /// Waited longer than the acquire timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Invalid pool configuration
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build the canonical "commands out of sync" client error.
    pub fn commands_out_of_sync() -> Self {
        Error::Client(ClientError {
            kind: ClientErrorKind::CommandsOutOfSync,
            code: CR_COMMANDS_OUT_OF_SYNC,
            message: COMMANDS_OUT_OF_SYNC_MESSAGE.to_string(),
        })
    }

    /// A prepared statement was given the wrong number of parameters.
    pub fn parameter_mismatch(expected: usize, given: usize) -> Self {
        Error::Client(ClientError {
            kind: ClientErrorKind::ParameterMismatch,
            code: CR_INVALID_PARAMETER_NO,
            message: format!("statement expects {expected} parameters, {given} given"),
        })
    }

    /// Build a connection error of the given kind.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// The connection (or pool) was already closed.
    pub fn already_closed() -> Self {
        Self::connection(ConnectionErrorKind::Closed, "connection already closed")
    }

    /// Build a protocol error carrying the offending payload.
    pub fn protocol(message: impl Into<String>, raw: Option<&[u8]>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: raw.map(<[u8]>::to_vec),
            source: None,
        })
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Server(_))
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Client(_))
    }

    /// Does this error leave the connection unusable?
    ///
    /// Server and client errors only abort the current command. Transport,
    /// framing and lifecycle errors poison the connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Connection(_) | Error::Protocol(_)
        )
    }

    /// Is this a retryable error (deadlock, lock wait timeout, pool pressure)?
    pub fn is_retryable(&self) -> bool {
        match self {
            // ER_LOCK_WAIT_TIMEOUT, ER_LOCK_DEADLOCK
            Error::Server(s) => matches!(s.code, 1205 | 1213),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted | PoolErrorKind::Timeout),
            _ => false,
        }
    }

    /// Numeric error code for server and client errors.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Error::Server(s) => Some(s.code),
            Error::Client(c) => Some(c.code),
            _ => None,
        }
    }

    /// Get the SQL state if the server sent one (e.g. "23000").
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(s) => s.sql_state.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Server(s) => s.sql.as_deref(),
            _ => None,
        }
    }

    /// Attach the SQL text to a server error; other variants pass through.
    #[must_use]
    pub fn with_sql(self, sql: &str) -> Self {
        match self {
            Error::Server(mut s) => {
                s.sql = Some(sql.to_string());
                Error::Server(s)
            }
            other => other,
        }
    }

    /// Server reported a duplicate key (1062).
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Error::Server(s) if s.is_duplicate_key())
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self, Error::Server(s) if s.is_foreign_key_violation())
    }

    /// Server reported an unknown table (1146).
    pub fn is_missing_table(&self) -> bool {
        matches!(self, Error::Server(s) if s.is_missing_table())
    }
}

impl ServerError {
    /// ER_DUP_ENTRY
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// ER_ROW_IS_REFERENCED_2 / ER_NO_REFERENCED_ROW_2
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }

    /// ER_NO_SUCH_TABLE
    pub fn is_missing_table(&self) -> bool {
        self.code == 1146
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Server(e) => write!(f, "{e}"),
            Error::Client(e) => write!(f, "{e}"),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql_state {
            Some(state) => write!(
                f,
                "MySQL server error {} ({}): {}",
                self.code, state, self.message
            ),
            None => write!(f, "MySQL server error {}: {}", self.code, self.message),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MySQL client error {}: {}", self.code, self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Error::Client(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server(code: u16) -> Error {
        Error::Server(ServerError {
            code,
            sql_state: Some("42S02".to_string()),
            message: "Table 'test.nope' doesn't exist".to_string(),
            sql: None,
        })
    }

    #[test]
    fn test_server_error_is_not_connection_fatal() {
        let err = server(1146);
        assert!(err.is_server_error());
        assert!(!err.is_connection_fatal());
        assert_eq!(err.error_code(), Some(1146));
        assert_eq!(err.sql_state(), Some("42S02"));
    }

    #[test]
    fn test_commands_out_of_sync() {
        let err = Error::commands_out_of_sync();
        assert!(err.is_client_error());
        assert_eq!(err.error_code(), Some(CR_COMMANDS_OUT_OF_SYNC));
        assert_eq!(
            err.to_string(),
            "MySQL client error 2014: Commands out of sync; you can't run this command now"
        );
    }

    #[test]
    fn test_with_sql_only_touches_server_errors() {
        let err = server(1146).with_sql("SELECT * FROM nope");
        assert_eq!(err.sql(), Some("SELECT * FROM nope"));

        let err = Error::already_closed().with_sql("SELECT 1");
        assert_eq!(err.sql(), None);
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn test_retryable_flags() {
        assert!(server(1213).is_retryable());
        assert!(server(1205).is_retryable());
        assert!(!server(1062).is_retryable());

        let pool = Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: "timed out".to_string(),
            source: None,
        });
        assert!(pool.is_retryable());
    }

    #[test]
    fn test_server_error_helpers() {
        let dup = ServerError {
            code: 1062,
            sql_state: Some("23000".to_string()),
            message: "Duplicate entry".to_string(),
            sql: None,
        };
        assert!(dup.is_duplicate_key());
        assert!(!dup.is_foreign_key_violation());
        assert!(!dup.is_missing_table());
    }

    #[test]
    fn test_error_classification_helpers() {
        assert!(server(1062).is_duplicate_key());
        assert!(!server(1062).is_missing_table());
        assert!(server(1146).is_missing_table());
        assert!(server(1452).is_foreign_key_violation());
        assert!(server(1451).is_foreign_key_violation());

        let client = Error::commands_out_of_sync();
        assert!(!client.is_duplicate_key());
        assert!(!client.is_foreign_key_violation());
        assert!(!client.is_missing_table());
    }
}
