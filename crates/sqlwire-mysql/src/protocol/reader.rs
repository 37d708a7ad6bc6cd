//! Cursor over a single packet payload.
//!
//! All reads return `None` when the payload is exhausted, so decoders can use
//! `?` inside `Option`-returning helpers and convert to a protocol error once.

#![allow(clippy::cast_possible_truncation)]

use super::codec::{self, u24_from_le};
use super::{EofPacket, ErrPacket, OkPacket};

/// A reader for MySQL protocol data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let chunk = self.data.get(self.pos..)?.first_chunk::<N>()?;
        self.pos += N;
        Some(*chunk)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|[b]| b)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u24_le(&mut self) -> Option<u32> {
        self.read_array().map(u24_from_le)
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i8(&mut self) -> Option<i8> {
        self.read_array().map(i8::from_le_bytes)
    }

    pub fn read_i16_le(&mut self) -> Option<i16> {
        self.read_array().map(i16::from_le_bytes)
    }

    pub fn read_i32_le(&mut self) -> Option<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_i64_le(&mut self) -> Option<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_f32_le(&mut self) -> Option<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_f64_le(&mut self) -> Option<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Read a length-encoded integer that must not be NULL.
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        self.read_lenenc_nullable()?
    }

    /// Read a length-encoded integer.
    ///
    /// The outer `None` means the payload ended early; the inner `None` is
    /// the `0xFB` NULL marker.
    pub fn read_lenenc_nullable(&mut self) -> Option<Option<u64>> {
        let (value, consumed) = codec::length_encoded_int(self.data.get(self.pos..)?).ok()?;
        self.pos += consumed;
        Some(value)
    }

    /// Read a length-encoded byte string, distinguishing NULL from truncation.
    pub fn read_lenenc_bytes_nullable(&mut self) -> Option<Option<&'a [u8]>> {
        let rest = self.data.get(self.pos..)?;
        let (body, consumed) = codec::length_encoded_bytes(rest).ok()?;
        self.pos += consumed;
        Some(body)
    }

    /// Read a length-encoded string.
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        let len = self.read_lenenc_int()? as usize;
        self.read_string(len)
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_lenenc_int()? as usize;
        self.read_bytes(len)
    }

    /// Read a null-terminated string.
    ///
    /// A missing terminator reads to the end of the payload.
    pub fn read_null_string(&mut self) -> Option<String> {
        let rest = self.data.get(self.pos..)?;
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += (end + 1).min(rest.len());
        Some(s)
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.pos..self.pos.checked_add(len)?)?;
        self.pos += len;
        Some(bytes)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> bool {
        self.read_bytes(n).is_some()
    }

    /// Parse an OK packet.
    ///
    /// Layout (protocol 4.1): `0x00`, affected_rows (lenenc), last_insert_id
    /// (lenenc), status_flags (2), warnings (2), info (rest).
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if self.peek() == Some(0x00) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        // Pre-4.1 servers may stop here
        let status_flags = self.read_u16_le().unwrap_or(0);
        let warnings = self.read_u16_le().unwrap_or(0);
        let info = self.read_rest_string();

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an ERR packet.
    ///
    /// Layout: `0xFF`, error_code (2), optional `#` + sql_state (5), message.
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;

        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            Some(self.read_string(5)?)
        } else {
            None
        };

        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet: `0xFE`, warnings (2), status_flags (2).
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_fixed_width() {
        let mut reader = PacketReader::new(&[
            0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12,
        ]);
        assert_eq!(reader.read_u8(), Some(0x42));
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_u32_le(), Some(0x1234_5678));
        assert_eq!(reader.read_u8(), None);
    }

    #[test]
    fn test_read_signed_and_float() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-2i16).to_le_bytes());
        data.extend_from_slice(&1.5f32.to_le_bytes());
        data.extend_from_slice(&(-7i64).to_le_bytes());
        let mut reader = PacketReader::new(&data);
        assert_eq!(reader.read_i16_le(), Some(-2));
        assert_eq!(reader.read_f32_le(), Some(1.5));
        assert_eq!(reader.read_i64_le(), Some(-7));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_read_past_end_does_not_advance() {
        let mut reader = PacketReader::new(&[0x01, 0x02]);
        assert_eq!(reader.read_u32_le(), None);
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_u16_le(), Some(0x0201));
    }

    #[test]
    fn test_lenenc_nullable() {
        let mut reader = PacketReader::new(&[0xFB, 0x03, b'a', b'b', b'c', 0xFC]);
        assert_eq!(reader.read_lenenc_bytes_nullable(), Some(None));
        assert_eq!(reader.read_lenenc_bytes_nullable(), Some(Some(&b"abc"[..])));
        assert_eq!(reader.read_lenenc_nullable(), None);
    }

    #[test]
    fn test_read_null_string() {
        let mut reader = PacketReader::new(b"hello\0world");
        assert_eq!(reader.read_null_string(), Some("hello".to_string()));
        assert_eq!(reader.read_null_string(), Some("world".to_string()));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_parse_ok_packet() {
        // affected_rows=1, last_insert_id=42, status=2, warnings=0
        let data = [0x00, 0x01, 0x2A, 0x02, 0x00, 0x00, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 42);
        assert_eq!(ok.status_flags, 2);
        assert_eq!(ok.warnings, 0);
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x15, 0x04, b'#'];
        data.extend_from_slice(b"28000");
        data.extend_from_slice(b"Access denied");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state.as_deref(), Some("28000"));
        assert_eq!(err.error_message, "Access denied");
    }

    #[test]
    fn test_parse_err_packet_without_state() {
        let mut data = vec![0xFF, 0xDE, 0x07];
        data.extend_from_slice(b"Commands out of sync");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 2014);
        assert_eq!(err.sql_state, None);
        assert_eq!(err.error_message, "Commands out of sync");
    }

    #[test]
    fn test_parse_eof_packet() {
        let data = [0xFE, 0x00, 0x00, 0x08, 0x00];
        let eof = PacketReader::new(&data).parse_eof_packet().unwrap();
        assert_eq!(eof.warnings, 0);
        assert_eq!(eof.status_flags, 0x0008);
    }
}
