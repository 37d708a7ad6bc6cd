//! Core types for sqlwire.
//!
//! This crate holds the pieces every driver layer shares:
//!
//! - `Error` and `Result`, the client/server/transport error taxonomy
//! - `Value`, a dynamically-typed SQL value
//! - `Row` and `ColumnInfo` for decoded result rows

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    COMMANDS_OUT_OF_SYNC_MESSAGE, CR_COMMANDS_OUT_OF_SYNC, CR_INVALID_PARAMETER_NO, ClientError,
    ClientErrorKind, ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError,
    PoolErrorKind, ProtocolError, Result, ServerError, TransactionError, TransactionErrorKind,
    TypeError,
};
pub use row::{ColumnInfo, Row};
pub use value::Value;
