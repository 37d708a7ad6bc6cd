//! MySQL prepared statement (binary protocol) packets.
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: client sends COM_STMT_PREPARE with the SQL text.
//!    The server answers with a prepare-OK (statement id, column count,
//!    parameter count), then one definition packet per parameter and per
//!    result column, each run terminated by EOF.
//! 2. **Execute**: client sends COM_STMT_EXECUTE with the statement id and
//!    the binary parameter block. The server answers with OK, ERR, or a
//!    binary result set.
//! 3. **Close**: client sends COM_STMT_CLOSE. The server does not reply.

#![allow(clippy::cast_possible_truncation)]

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use super::{Command, PacketReader, PacketWriter, build_command_packet};
use crate::types::FieldType;
use sqlwire_core::Value;

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    /// Server-assigned statement id (used in execute/close)
    pub statement_id: u32,
    /// Number of result columns (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of `?` placeholders
    pub num_params: u16,
    pub warnings: u16,
}

impl StmtPrepareOk {
    /// How many EOF-terminated definition runs follow the prepare-OK.
    pub fn definition_runs(&self) -> usize {
        usize::from(self.num_params > 0) + usize::from(self.num_columns > 0)
    }
}

/// Build a COM_STMT_PREPARE packet.
pub fn build_stmt_prepare_packet(sql: &str) -> Vec<u8> {
    build_command_packet(Command::StmtPrepare, sql.as_bytes())
}

/// Build a COM_STMT_CLOSE packet. The server sends no response.
pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    build_command_packet(Command::StmtClose, &statement_id.to_le_bytes())
}

/// Build a COM_STMT_EXECUTE packet.
///
/// Payload layout:
/// - command byte (0x17), statement id (4)
/// - flags (1): 0x00, no cursor
/// - iteration count (4): always 1
/// - when there are parameters: NULL bitmap of `(n + 7) / 8` bytes,
///   new-params-bound flag (1), `n` pairs of (type, flags), then the
///   non-NULL values in binary encoding
pub fn build_stmt_execute_packet(statement_id: u32, params: &[Value]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(16 + params.len() * 16);

    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        writer.write_bytes(&null_bitmap);

        writer.write_u8(1);

        for param in params {
            writer.write_u8(param_field_type(param) as u8);
            writer.write_u8(if param.is_unsigned() { 0x80 } else { 0x00 });
        }

        for param in params {
            encode_binary_param(&mut writer, param);
        }
    }

    writer.build_packet(0)
}

/// Parse a COM_STMT_PREPARE response payload.
///
/// Layout: status 0x00, statement id (4), columns (2), params (2),
/// reserved (1), warnings (2, optional).
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    let mut reader = PacketReader::new(data);
    if reader.read_u8()? != 0x00 {
        return None;
    }
    let statement_id = reader.read_u32_le()?;
    let num_columns = reader.read_u16_le()?;
    let num_params = reader.read_u16_le()?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);

    Some(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

/// Wire type announced for a bound parameter.
fn param_field_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::TinyInt(_) | Value::UTinyInt(_) => FieldType::Tiny,
        Value::SmallInt(_) | Value::USmallInt(_) => FieldType::Short,
        Value::Int(_) | Value::UInt(_) => FieldType::Long,
        Value::BigInt(_) | Value::UBigInt(_) => FieldType::LongLong,
        Value::Float(_) => FieldType::Float,
        Value::Double(_) => FieldType::Double,
        Value::Decimal(_) => FieldType::NewDecimal,
        Value::Text(_) => FieldType::VarString,
        Value::Bytes(_) => FieldType::Blob,
        Value::Date(_) => FieldType::Date,
        Value::Time(_) => FieldType::Time,
        Value::DateTime(_) => FieldType::DateTime,
        Value::Timestamp(_) => FieldType::Timestamp,
    }
}

fn encode_binary_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        // Carried by the NULL bitmap only
        Value::Null => {}
        Value::TinyInt(i) => writer.write_u8(*i as u8),
        Value::UTinyInt(i) => writer.write_u8(*i),
        Value::SmallInt(i) => writer.write_u16_le(*i as u16),
        Value::USmallInt(i) => writer.write_u16_le(*i),
        Value::Int(i) => writer.write_u32_le(*i as u32),
        Value::UInt(i) => writer.write_u32_le(*i),
        Value::BigInt(i) => writer.write_u64_le(*i as u64),
        Value::UBigInt(i) => writer.write_u64_le(*i),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Date(d) => encode_binary_date(writer, *d),
        Value::Time(t) => encode_binary_time(writer, *t),
        Value::DateTime(dt) | Value::Timestamp(dt) => encode_binary_datetime(writer, *dt),
    }
}

fn encode_binary_date(writer: &mut PacketWriter, date: NaiveDate) {
    writer.write_u8(4);
    writer.write_u16_le(date.year() as u16);
    writer.write_u8(date.month() as u8);
    writer.write_u8(date.day() as u8);
}

fn encode_binary_time(writer: &mut PacketWriter, time: NaiveTime) {
    let micros = time.nanosecond() / 1_000;
    writer.write_u8(if micros == 0 { 8 } else { 12 });
    // is_negative, days
    writer.write_u8(0);
    writer.write_u32_le(0);
    writer.write_u8(time.hour() as u8);
    writer.write_u8(time.minute() as u8);
    writer.write_u8(time.second() as u8);
    if micros != 0 {
        writer.write_u32_le(micros);
    }
}

fn encode_binary_datetime(writer: &mut PacketWriter, dt: NaiveDateTime) {
    let micros = dt.nanosecond() / 1_000;
    let has_time = dt.hour() != 0 || dt.minute() != 0 || dt.second() != 0;
    let len = match (has_time, micros != 0) {
        (_, true) => 11,
        (true, false) => 7,
        (false, false) => 4,
    };
    writer.write_u8(len);
    writer.write_u16_le(dt.year() as u16);
    writer.write_u8(dt.month() as u8);
    writer.write_u8(dt.day() as u8);
    if len >= 7 {
        writer.write_u8(dt.hour() as u8);
        writer.write_u8(dt.minute() as u8);
        writer.write_u8(dt.second() as u8);
    }
    if len == 11 {
        writer.write_u32_le(micros);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stmt_prepare_ok() {
        let data = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00];
        let ok = parse_stmt_prepare_ok(&data).unwrap();
        assert_eq!(ok.statement_id, 1);
        assert_eq!(ok.num_columns, 2);
        assert_eq!(ok.num_params, 3);
        assert_eq!(ok.definition_runs(), 2);
    }

    #[test]
    fn test_parse_stmt_prepare_ok_rejects_error() {
        assert!(parse_stmt_prepare_ok(&[0xFF, 0x15, 0x04]).is_none());
        assert!(parse_stmt_prepare_ok(&[0x00, 0x01]).is_none());
    }

    #[test]
    fn test_execute_packet_layout() {
        let packet = build_stmt_execute_packet(
            7,
            &[Value::Int(42), Value::Null, Value::Text("hi".to_string())],
        );
        let payload = &packet[4..];
        assert_eq!(payload[0], Command::StmtExecute as u8);
        assert_eq!(&payload[1..5], &7u32.to_le_bytes());
        assert_eq!(payload[5], 0x00);
        assert_eq!(&payload[6..10], &1u32.to_le_bytes());
        // NULL bitmap: param 1 is NULL
        assert_eq!(payload[10], 0b0000_0010);
        // new-params-bound
        assert_eq!(payload[11], 1);
        assert_eq!(
            &payload[12..18],
            &[
                FieldType::Long as u8,
                0,
                FieldType::Null as u8,
                0,
                FieldType::VarString as u8,
                0
            ]
        );
        assert_eq!(&payload[18..22], &42i32.to_le_bytes());
        assert_eq!(&payload[22..], &[0x02, b'h', b'i']);
    }

    #[test]
    fn test_execute_packet_without_params() {
        let packet = build_stmt_execute_packet(1, &[]);
        assert_eq!(packet.len(), 4 + 10);
    }

    #[test]
    fn test_unsigned_param_flag() {
        let packet = build_stmt_execute_packet(1, &[Value::UBigInt(u64::MAX)]);
        let payload = &packet[4..];
        assert_eq!(&payload[12..14], &[FieldType::LongLong as u8, 0x80]);
        assert_eq!(&payload[14..22], &u64::MAX.to_le_bytes());
    }

    #[test]
    fn test_datetime_encoding_lengths() {
        let date = NaiveDate::from_ymd_opt(2017, 11, 6).unwrap();
        let mut writer = PacketWriter::new();
        encode_binary_datetime(&mut writer, date.and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(writer.as_bytes(), &[4, 0xE1, 0x07, 11, 6]);

        let mut writer = PacketWriter::new();
        encode_binary_datetime(&mut writer, date.and_hms_opt(10, 20, 30).unwrap());
        assert_eq!(writer.as_bytes(), &[7, 0xE1, 0x07, 11, 6, 10, 20, 30]);

        let mut writer = PacketWriter::new();
        encode_binary_datetime(&mut writer, date.and_hms_micro_opt(10, 20, 30, 5).unwrap());
        assert_eq!(writer.as_bytes()[0], 11);
        assert_eq!(&writer.as_bytes()[8..], &5u32.to_le_bytes());
    }

    #[test]
    fn test_close_packet() {
        let packet = build_stmt_close_packet(9);
        assert_eq!(packet, vec![5, 0, 0, 0, Command::StmtClose as u8, 9, 0, 0, 0]);
    }
}
