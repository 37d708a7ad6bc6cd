//! Result-set row decoders.
//!
//! Rows of a plain query come in the text protocol (every column is a
//! length-encoded string), rows of an executed prepared statement in the
//! binary protocol (NULL bitmap followed by type-specific encodings). Both
//! decoders see the same three payload classes: a classic EOF packet that
//! ends the set, an error packet, or a data row.

#![allow(clippy::cast_possible_wrap)]

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlwire_core::{ColumnInfo, Error, Result, Row, Value};

use crate::classify::classify;
use crate::protocol::{PacketReader, PacketType};
use crate::types::{Field, FieldType, column_info};

/// Shared contract of the text and binary row decoders.
pub trait RowDecoder: Send + std::fmt::Debug {
    /// Column definitions this decoder was built for.
    fn fields(&self) -> &[Field];

    /// Decode one result-set packet.
    ///
    /// `Ok(Some(row))` for a data row, `Ok(None)` for the EOF terminator
    /// (which also updates [`has_more_results`](Self::has_more_results)),
    /// and `Err` for an error packet or a malformed row.
    fn parse(&mut self, payload: &[u8]) -> Result<Option<Row>>;

    /// Whether the last EOF announced another result set.
    fn has_more_results(&self) -> bool;
}

/// Which row encoding a result set uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// `COM_QUERY` results
    Text,
    /// `COM_STMT_EXECUTE` results
    Binary,
}

impl RowFormat {
    /// Build the decoder for this format over `fields`.
    pub fn decoder(self, fields: Vec<Field>) -> Box<dyn RowDecoder> {
        match self {
            RowFormat::Text => Box::new(TextRowDecoder::new(fields)),
            RowFormat::Binary => Box::new(BinaryRowDecoder::new(fields)),
        }
    }
}

/// Handle the EOF and error classes shared by both decoders.
///
/// Returns `Ok(Some(more_results))` for EOF, `Ok(None)` for a data row.
fn terminator(payload: &[u8]) -> Result<Option<bool>> {
    match PacketType::of(payload) {
        PacketType::Eof => {
            let eof = PacketReader::new(payload)
                .parse_eof_packet()
                .ok_or_else(|| Error::protocol("truncated EOF packet", Some(payload)))?;
            Ok(Some(eof.has_more_results()))
        }
        PacketType::Error => Err(classify(payload)
            .unwrap_or_else(|| Error::protocol("malformed error packet", Some(payload)))),
        _ => Ok(None),
    }
}

/// Decoder for text-protocol rows.
#[derive(Debug)]
pub struct TextRowDecoder {
    fields: Vec<Field>,
    columns: Arc<ColumnInfo>,
    has_more_results: bool,
}

impl TextRowDecoder {
    pub fn new(fields: Vec<Field>) -> Self {
        let columns = column_info(&fields);
        Self {
            fields,
            columns,
            has_more_results: false,
        }
    }
}

impl RowDecoder for TextRowDecoder {
    fn fields(&self) -> &[Field] {
        &self.fields
    }

    fn parse(&mut self, payload: &[u8]) -> Result<Option<Row>> {
        if let Some(more) = terminator(payload)? {
            self.has_more_results = more;
            return Ok(None);
        }

        let mut reader = PacketReader::new(payload);
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let cell = reader.read_lenenc_bytes_nullable().ok_or_else(|| {
                Error::protocol(
                    format!("text row truncated at column '{}'", field.name),
                    Some(payload),
                )
            })?;
            values.push(match cell {
                None => Value::Null,
                Some(data) => decode_text_value(field, data),
            });
        }
        Ok(Some(Row::with_columns(Arc::clone(&self.columns), values)))
    }

    fn has_more_results(&self) -> bool {
        self.has_more_results
    }
}

/// Cast a text-protocol cell by its declared column type.
///
/// Numbers that fail to parse are kept as text. Zero dates such as
/// `0000-00-00` cannot be represented and decode to NULL.
pub fn decode_text_value(field: &Field, data: &[u8]) -> Value {
    let text = String::from_utf8_lossy(data);
    let unsigned = field.is_unsigned();
    let fallback = || Value::Text(text.to_string());

    match field.field_type {
        FieldType::Tiny if unsigned => text.parse().map_or_else(|_| fallback(), Value::UTinyInt),
        FieldType::Tiny => text.parse().map_or_else(|_| fallback(), Value::TinyInt),
        FieldType::Short | FieldType::Year if unsigned => {
            text.parse().map_or_else(|_| fallback(), Value::USmallInt)
        }
        FieldType::Short | FieldType::Year => {
            text.parse().map_or_else(|_| fallback(), Value::SmallInt)
        }
        FieldType::Long | FieldType::Int24 if unsigned => {
            text.parse().map_or_else(|_| fallback(), Value::UInt)
        }
        FieldType::Long | FieldType::Int24 => text.parse().map_or_else(|_| fallback(), Value::Int),
        FieldType::LongLong if unsigned => {
            text.parse().map_or_else(|_| fallback(), Value::UBigInt)
        }
        FieldType::LongLong => text.parse().map_or_else(|_| fallback(), Value::BigInt),
        FieldType::Float => text.parse().map_or_else(|_| fallback(), Value::Float),
        FieldType::Double => text.parse().map_or_else(|_| fallback(), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),

        FieldType::Date | FieldType::NewDate => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map_or(Value::Null, Value::Date),
        FieldType::Time => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
            .map_or_else(|_| fallback(), Value::Time),
        FieldType::DateTime => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
            .map_or(Value::Null, Value::DateTime),
        FieldType::Timestamp => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
            .map_or(Value::Null, Value::Timestamp),

        FieldType::Null => Value::Null,
        FieldType::Bit | FieldType::Geometry => Value::Bytes(data.to_vec()),
        _ if field.is_binary() => Value::Bytes(data.to_vec()),
        _ => Value::Text(text.into_owned()),
    }
}

/// Decoder for binary-protocol rows.
#[derive(Debug)]
pub struct BinaryRowDecoder {
    fields: Vec<Field>,
    columns: Arc<ColumnInfo>,
    has_more_results: bool,
}

impl BinaryRowDecoder {
    pub fn new(fields: Vec<Field>) -> Self {
        let columns = column_info(&fields);
        Self {
            fields,
            columns,
            has_more_results: false,
        }
    }

    /// Size of the NULL bitmap: two reserved bits, one bit per column.
    pub fn null_bitmap_len(columns: usize) -> usize {
        (columns + 7 + 2) >> 3
    }
}

impl RowDecoder for BinaryRowDecoder {
    fn fields(&self) -> &[Field] {
        &self.fields
    }

    fn parse(&mut self, payload: &[u8]) -> Result<Option<Row>> {
        if let Some(more) = terminator(payload)? {
            self.has_more_results = more;
            return Ok(None);
        }

        let truncated = |what: &str| Error::protocol(format!("binary row truncated: {what}"), Some(payload));
        let mut reader = PacketReader::new(payload);
        if reader.read_u8() != Some(0x00) {
            return Err(Error::protocol("binary row without 0x00 header", Some(payload)));
        }
        let bitmap = reader
            .read_bytes(Self::null_bitmap_len(self.fields.len()))
            .ok_or_else(|| truncated("null bitmap"))?;

        let mut values = Vec::with_capacity(self.fields.len());
        for (i, field) in self.fields.iter().enumerate() {
            let bit = i + 2;
            if bitmap[bit >> 3] & (1 << (bit & 7)) != 0 {
                values.push(Value::Null);
                continue;
            }
            let value = decode_binary_value(field, &mut reader)
                .ok_or_else(|| truncated(&field.name))?;
            values.push(value);
        }
        Ok(Some(Row::with_columns(Arc::clone(&self.columns), values)))
    }

    fn has_more_results(&self) -> bool {
        self.has_more_results
    }
}

/// Decode one non-NULL binary column; `None` if the payload ran out.
pub fn decode_binary_value(field: &Field, reader: &mut PacketReader<'_>) -> Option<Value> {
    let unsigned = field.is_unsigned();
    let value = match field.field_type {
        FieldType::Null => Value::Null,
        FieldType::Tiny if unsigned => Value::UTinyInt(reader.read_u8()?),
        FieldType::Tiny => Value::TinyInt(reader.read_i8()?),
        FieldType::Short | FieldType::Year if unsigned => Value::USmallInt(reader.read_u16_le()?),
        FieldType::Short | FieldType::Year => Value::SmallInt(reader.read_i16_le()?),
        FieldType::Long | FieldType::Int24 if unsigned => Value::UInt(reader.read_u32_le()?),
        FieldType::Long | FieldType::Int24 => Value::Int(reader.read_i32_le()?),
        FieldType::LongLong if unsigned => Value::UBigInt(reader.read_u64_le()?),
        FieldType::LongLong => Value::BigInt(reader.read_i64_le()?),
        FieldType::Float => Value::Float(reader.read_f32_le()?),
        FieldType::Double => Value::Double(reader.read_f64_le()?),

        FieldType::Date | FieldType::NewDate => {
            let data = read_temporal(reader)?;
            binary_date(data).map_or(Value::Null, Value::Date)
        }
        FieldType::Time => Value::Time(binary_time(read_temporal(reader)?)),
        FieldType::DateTime => {
            binary_datetime(read_temporal(reader)?).map_or(Value::Null, Value::DateTime)
        }
        FieldType::Timestamp => {
            binary_datetime(read_temporal(reader)?).map_or(Value::Null, Value::Timestamp)
        }

        FieldType::Decimal | FieldType::NewDecimal => {
            Value::Decimal(String::from_utf8_lossy(reader.read_lenenc_bytes()?).into_owned())
        }
        FieldType::Bit | FieldType::Geometry => Value::Bytes(reader.read_lenenc_bytes()?.to_vec()),
        _ => {
            let data = reader.read_lenenc_bytes()?;
            if field.is_binary() {
                Value::Bytes(data.to_vec())
            } else {
                Value::Text(String::from_utf8_lossy(data).into_owned())
            }
        }
    };
    Some(value)
}

/// Read a 1-byte length prefix and the temporal body that follows.
fn read_temporal<'a>(reader: &mut PacketReader<'a>) -> Option<&'a [u8]> {
    let len = reader.read_u8()?;
    reader.read_bytes(usize::from(len))
}

/// DATE body: year (2), month, day. Length 0 is the zero date.
fn binary_date(data: &[u8]) -> Option<NaiveDate> {
    let [y0, y1, month, day, ..] = *data else {
        return None;
    };
    NaiveDate::from_ymd_opt(
        i32::from(u16::from_le_bytes([y0, y1])),
        u32::from(month),
        u32::from(day),
    )
}

/// TIME body: sign, days (4), hour, minute, second, [micros (4)].
///
/// Lengths other than 8 and 12 (notably 0) are midnight. The day count and
/// sign cannot be carried by a time of day and are dropped.
fn binary_time(data: &[u8]) -> NaiveTime {
    let time = match data.len() {
        8 => NaiveTime::from_hms_opt(u32::from(data[5]), u32::from(data[6]), u32::from(data[7])),
        12 => NaiveTime::from_hms_micro_opt(
            u32::from(data[5]),
            u32::from(data[6]),
            u32::from(data[7]),
            u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        ),
        _ => None,
    };
    time.unwrap_or(NaiveTime::MIN)
}

/// DATETIME/TIMESTAMP body: date (4), [hour, minute, second], [micros (4)].
fn binary_datetime(data: &[u8]) -> Option<NaiveDateTime> {
    let date = binary_date(data)?;
    let time = match data.len() {
        4 => Some(NaiveTime::MIN),
        7 => NaiveTime::from_hms_opt(u32::from(data[4]), u32::from(data[5]), u32::from(data[6])),
        11 => NaiveTime::from_hms_micro_opt(
            u32::from(data[4]),
            u32::from(data[5]),
            u32::from(data[6]),
            u32::from_le_bytes([data[7], data[8], data[9], data[10]]),
        ),
        _ => None,
    }?;
    Some(date.and_time(time))
}
