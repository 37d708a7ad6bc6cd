//! Payload builder and packet framing for outgoing data.

#![allow(clippy::cast_possible_truncation)]

use super::codec::{encode_header, encode_length_encoded_int, u24_to_le};
use super::{Command, MAX_PACKET_SIZE};

/// A writer for MySQL protocol payloads.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    /// Create a new writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new writer with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the payload.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&u24_to_le(value));
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    pub fn write_lenenc_int(&mut self, value: u64) {
        encode_length_encoded_int(value, &mut self.buffer);
    }

    /// Write a length-encoded string.
    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    /// Write a length-encoded byte slice.
    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    /// Write a null-terminated string.
    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write zeros (padding).
    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }

    /// Frame the accumulated payload, starting at `sequence_id`.
    pub fn build_packet(&self, sequence_id: u8) -> Vec<u8> {
        frame_payload(&self.buffer, sequence_id)
    }
}

/// Frame a payload into one or more physical packets.
///
/// Payloads of `MAX_PACKET_SIZE` bytes or more are split into full-size
/// chunks; a trailing chunk shorter than the maximum (possibly empty) ends
/// the sequence. Sequence ids increment per physical packet.
pub fn frame_payload(payload: &[u8], mut sequence_id: u8) -> Vec<u8> {
    let packets = payload.len() / MAX_PACKET_SIZE + 1;
    let mut out = Vec::with_capacity(payload.len() + packets * 4);
    let mut chunks = payload.chunks(MAX_PACKET_SIZE);
    loop {
        let chunk = chunks.next().unwrap_or_default();
        out.extend_from_slice(&encode_header(chunk.len(), sequence_id));
        out.extend_from_slice(chunk);
        sequence_id = sequence_id.wrapping_add(1);
        if chunk.len() < MAX_PACKET_SIZE {
            return out;
        }
    }
}

/// Build a command packet (`command` byte followed by `payload`).
///
/// Commands always start a new exchange, so the sequence id is 0.
pub fn build_command_packet(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + payload.len());
    writer.write_u8(command as u8);
    writer.write_bytes(payload);
    writer.build_packet(0)
}
