//! In-memory server stand-ins for tests.
//!
//! [`ScriptedTransport`] replays canned server bytes to a blocking
//! connection and records what the client wrote. The packet builders produce
//! server-side payloads (greeting, OK, error, EOF, column definitions, text
//! rows). Used by this workspace's tests and by hosts that want to exercise
//! their own code against a connection without a server.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::auth::plugins;
use crate::protocol::{PacketWriter, capabilities, charset, frame_payload};
use crate::transport::Transport;
use crate::types::Field;

/// Transport that replays scripted server bytes and records writes.
///
/// Clones share the script and the write log, so a test can keep one clone
/// while the connection owns another. An exhausted script reads as a closed
/// stream.
#[derive(Debug, Default, Clone)]
pub struct ScriptedTransport {
    reads: Arc<Mutex<VecDeque<Vec<u8>>>>,
    written: Arc<Mutex<Vec<u8>>>,
    refuse_writes: Arc<AtomicBool>,
    closed: bool,
}

impl ScriptedTransport {
    /// A transport whose script starts with a successful login.
    pub fn with_login(connection_id: u32) -> Self {
        let transport = Self::default();
        transport.push(login_bytes_for(connection_id));
        transport
    }

    /// Append server bytes to the script.
    pub fn push(&self, bytes: Vec<u8>) {
        self.reads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(bytes);
    }

    /// Bytes written by the client since the last call.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Make every later write fail as if the peer had gone away.
    pub fn refuse_writes(&self) {
        self.refuse_writes.store(true, Ordering::SeqCst);
    }

    /// Script chunks not yet read.
    pub fn remaining(&self) -> usize {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Transport for ScriptedTransport {
    fn open(&mut self) -> io::Result<()> {
        self.closed = false;
        Ok(())
    }

    fn read(&mut self, up_to: usize) -> io::Result<Vec<u8>> {
        let mut reads = self.reads.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut chunk) = reads.pop_front() else {
            return Ok(Vec::new());
        };
        if chunk.len() > up_to {
            reads.push_front(chunk.split_off(up_to));
        }
        Ok(chunk)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        if self.refuse_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A protocol-10 greeting as sent by MySQL 8.
pub fn handshake_packet(plugin: &str, connection_id: u32) -> Vec<u8> {
    let caps = capabilities::CLIENT_PROTOCOL_41
        | capabilities::CLIENT_SECURE_CONNECTION
        | capabilities::CLIENT_PLUGIN_AUTH
        | capabilities::CLIENT_CONNECT_WITH_DB
        | capabilities::CLIENT_TRANSACTIONS
        | capabilities::CLIENT_LONG_PASSWORD
        | capabilities::CLIENT_LONG_FLAG;
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.36");
    w.write_u32_le(connection_id);
    w.write_bytes(b"abcdefgh");
    w.write_u8(0);
    #[allow(clippy::cast_possible_truncation)]
    w.write_u16_le(caps as u16);
    w.write_u8(charset::UTF8MB4_GENERAL_CI);
    w.write_u16_le(0x0002);
    #[allow(clippy::cast_possible_truncation)]
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(b"ijklmnopqrst");
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}

pub fn ok_payload(affected: u64, insert_id: u64, status: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected);
    w.write_lenenc_int(insert_id);
    w.write_u16_le(status);
    w.write_u16_le(0);
    w.into_bytes()
}

pub fn err_payload(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut out = vec![0xFF];
    out.extend_from_slice(&code.to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(state.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

pub fn eof_payload() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

/// Encode a column-definition payload the way the server does.
pub fn column_definition(field: &Field) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string(&field.catalog);
    w.write_lenenc_string(&field.schema);
    w.write_lenenc_string(&field.table);
    w.write_lenenc_string(&field.org_table);
    w.write_lenenc_string(&field.name);
    w.write_lenenc_string(&field.org_name);
    w.write_lenenc_int(0x0c);
    w.write_u16_le(field.charset);
    w.write_u32_le(field.column_length);
    w.write_u8(field.field_type as u8);
    w.write_u16_le(field.flags);
    w.write_u8(field.decimals);
    w.write_zeros(2);
    w.into_bytes()
}

/// A text-protocol row; `None` is SQL NULL.
pub fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match value {
            Some(v) => w.write_lenenc_string(v),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

/// Framed packets for a complete text result set, starting at sequence 1.
pub fn result_set(fields: &[Field], rows: &[Vec<Option<&str>>]) -> Vec<u8> {
    let mut count = PacketWriter::new();
    count.write_lenenc_int(fields.len() as u64);
    let mut payloads = vec![count.into_bytes()];
    payloads.extend(fields.iter().map(column_definition));
    payloads.push(eof_payload());
    payloads.extend(rows.iter().map(|row| text_row(row)));
    payloads.push(eof_payload());
    frame_all(payloads, 1)
}

/// Frame each payload with consecutive sequence ids.
pub fn frame_all(payloads: Vec<Vec<u8>>, first_seq: u8) -> Vec<u8> {
    let mut out = Vec::new();
    let mut seq = first_seq;
    for payload in payloads {
        out.extend_from_slice(&frame_payload(&payload, seq));
        seq = seq.wrapping_add(1);
    }
    out
}

/// Greeting and auth OK, as a server sends them.
pub fn login_bytes() -> Vec<u8> {
    login_bytes_for(42)
}

pub fn login_bytes_for(connection_id: u32) -> Vec<u8> {
    let mut out = frame_payload(
        &handshake_packet(plugins::MYSQL_NATIVE_PASSWORD, connection_id),
        0,
    );
    out.extend_from_slice(&frame_payload(&ok_payload(0, 0, 2), 2));
    out
}

/// A framed OK reply to a command.
pub fn ok_packet(affected: u64) -> Vec<u8> {
    frame_payload(&ok_payload(affected, 0, 2), 1)
}

/// A framed error reply to a command.
pub fn err_packet(code: u16, state: &str, message: &str) -> Vec<u8> {
    frame_payload(&err_payload(code, state, message), 1)
}
