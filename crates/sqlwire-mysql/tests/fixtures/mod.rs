//! Shared helpers for the scripted protocol tests.

#![allow(dead_code)]

use sqlwire_mysql::event::{LoopbackPeer, LoopbackTransport, loopback};
use sqlwire_mysql::mock::{ScriptedTransport, login_bytes};
use sqlwire_mysql::{EventConnection, Field, FieldType, MySqlConfig, MySqlConnection};

pub fn config() -> MySqlConfig {
    MySqlConfig::new().user("app").password("secret")
}

pub fn users_fields() -> Vec<Field> {
    vec![
        Field::new("id", FieldType::LongLong),
        Field::new("name", FieldType::VarString),
        Field::new("created", FieldType::DateTime),
    ]
}

/// A logged-in blocking connection whose server replays `chunks` in order.
pub fn blocking(chunks: Vec<Vec<u8>>) -> (MySqlConnection<ScriptedTransport>, ScriptedTransport) {
    let transport = ScriptedTransport::with_login(42);
    for chunk in chunks {
        transport.push(chunk);
    }
    let conn = MySqlConnection::with_transport(transport.clone(), config()).unwrap();
    transport.take_written();
    (conn, transport)
}

/// A logged-in event connection and its peer.
pub fn event() -> (EventConnection<LoopbackTransport>, LoopbackPeer) {
    let (transport, peer) = loopback();
    let conn = EventConnection::new(transport, config());
    conn.open();
    assert!(peer.accept());
    peer.deliver(&login_bytes());
    assert!(conn.is_ready());
    peer.take_written();
    (conn, peer)
}

/// `bytes` cut into pieces of `size`.
pub fn split(bytes: &[u8], size: usize) -> Vec<Vec<u8>> {
    bytes.chunks(size).map(<[u8]>::to_vec).collect()
}
