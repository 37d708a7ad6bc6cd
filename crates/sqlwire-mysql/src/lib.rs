//! MySQL client protocol driver.
//!
//! This crate speaks the MySQL wire protocol directly over a byte stream. It
//! provides:
//!
//! - Packet framing with sequence numbers and 16MB continuation
//! - Authentication (mysql_native_password, caching_sha2_password)
//! - Text and binary row decoding
//! - Prepared statements with positional parameters
//! - A blocking connection over any [`Transport`]
//! - An event-driven connection ([`EventConnection`]) with a FIFO command
//!   queue, for hosts that run their own event loop
//! - Transactions on both connection kinds
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets over 16MB are split
//! - One command in flight per connection; the response must be read fully
//!   before the next command is written
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let conn = MySqlConnection::connect(config)?;
//! let rows = conn.query("SELECT id, name FROM users")?.rows()?;
//! ```

pub mod auth;
pub mod classify;
pub mod config;
pub mod connection;
pub mod event;
pub mod mock;
pub mod protocol;
pub mod rows;
pub mod transaction;
pub mod transport;
pub mod types;

pub use auth::{AuthStep, Authenticator, Handshake};
pub use classify::classify;
pub use config::MySqlConfig;
pub use connection::{MySqlConnection, QueryResult, QueryStatus, ResultSet};
pub use event::{Deferred, EventConnection, EventTransport, QueryEvent, QueryOutcome};
pub use rows::{BinaryRowDecoder, RowDecoder, RowFormat, TextRowDecoder};
pub use transport::{PacketStream, TcpTransport, Transport};
pub use types::{Field, FieldType};
