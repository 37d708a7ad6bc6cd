//! Event-driven connection for hosts that own the event loop.
//!
//! The blocking [`MySqlConnection`](crate::MySqlConnection) parks the calling
//! thread on every read. This module splits the same protocol into a sans-IO
//! [`Machine`] and a callback-driven [`EventConnection`] that feeds it from
//! any [`EventTransport`]. Results arrive as [`Deferred`] handles or as a
//! stream of [`QueryEvent`]s.

pub mod connection;
pub mod deferred;
pub mod machine;
pub mod transport;

pub use connection::{EventConnection, QueryEvent, QueryOutcome};
pub use deferred::{Deferred, Resolver, deferred};
pub use machine::{Effect, Event, Machine, Request, State};
pub use transport::{EventTransport, LoopbackPeer, LoopbackTransport, loopback};
