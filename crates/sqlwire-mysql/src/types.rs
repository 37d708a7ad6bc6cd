//! Field types and column definitions.
//!
//! Every result set starts with one column-definition packet per column.
//! They are parsed once into [`Field`]s, and the row decoders use the field
//! type, the `UNSIGNED` flag and the charset to pick a [`Value`] variant.
//!
//! [`Value`]: sqlwire_core::Value

use std::sync::Arc;

use sqlwire_core::{ColumnInfo, Error, Result};

use crate::protocol::{PacketReader, charset};

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    /// TINYINT
    Tiny = 0x01,
    /// SMALLINT
    Short = 0x02,
    /// INT
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    /// BIGINT
    LongLong = 0x08,
    /// MEDIUMINT
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    /// Internal to the server, never sent to clients
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    /// CHAR
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from its wire byte.
    ///
    /// Unknown codes are treated as strings so that new server types still
    /// come through as text.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    /// Types whose binary-protocol value is a length-encoded byte string.
    #[must_use]
    pub const fn is_length_encoded(self) -> bool {
        matches!(
            self,
            FieldType::Decimal
                | FieldType::NewDecimal
                | FieldType::VarChar
                | FieldType::Bit
                | FieldType::Json
                | FieldType::Enum
                | FieldType::Set
                | FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::VarString
                | FieldType::String
                | FieldType::Geometry
        )
    }
}

/// Column flags in result set metadata.
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNSIGNED: u16 = 32;
    pub const AUTO_INCREMENT: u16 = 512;
}

/// A column of a result set, parsed from a column-definition packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Catalog name (always "def")
    pub catalog: String,
    pub schema: String,
    /// Table name or alias
    pub table: String,
    pub org_table: String,
    /// Column name or alias
    pub name: String,
    pub org_name: String,
    /// Character set id; 63 means binary
    pub charset: u16,
    pub column_length: u32,
    pub field_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl Field {
    /// Build a field with just a name and type (handy in tests and mocks).
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            catalog: "def".to_string(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.into(),
            org_name: String::new(),
            charset: u16::from(charset::UTF8MB4_GENERAL_CI),
            column_length: 0,
            field_type,
            flags: 0,
            decimals: 0,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_charset(mut self, charset: u16) -> Self {
        self.charset = charset;
        self
    }

    /// Parse a protocol-4.1 column-definition payload.
    ///
    /// Layout: six length-encoded strings (catalog, schema, table, org_table,
    /// name, org_name), a length-encoded fixed-field length (0x0c), charset
    /// (2), column length (4), type (1), flags (2), decimals (1).
    pub fn parse(data: &[u8]) -> Result<Self> {
        let missing = |what: &str| Error::protocol(format!("column definition: missing {what}"), Some(data));
        let mut reader = PacketReader::new(data);

        let catalog = reader.read_lenenc_string().ok_or_else(|| missing("catalog"))?;
        let schema = reader.read_lenenc_string().ok_or_else(|| missing("schema"))?;
        let table = reader.read_lenenc_string().ok_or_else(|| missing("table"))?;
        let org_table = reader.read_lenenc_string().ok_or_else(|| missing("org_table"))?;
        let name = reader.read_lenenc_string().ok_or_else(|| missing("name"))?;
        let org_name = reader.read_lenenc_string().ok_or_else(|| missing("org_name"))?;

        reader.read_lenenc_int().ok_or_else(|| missing("fixed length"))?;

        let charset = reader.read_u16_le().ok_or_else(|| missing("charset"))?;
        let column_length = reader.read_u32_le().ok_or_else(|| missing("column_length"))?;
        let field_type = FieldType::from_u8(reader.read_u8().ok_or_else(|| missing("type"))?);
        let flags = reader.read_u16_le().ok_or_else(|| missing("flags"))?;
        let decimals = reader.read_u8().ok_or_else(|| missing("decimals"))?;

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            field_type,
            flags,
            decimals,
        })
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Does this column carry raw bytes rather than text?
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        self.charset == charset::BINARY as u16
    }
}

/// Shared column metadata for rows of one result set.
pub fn column_info(fields: &[Field]) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::new(
        fields.iter().map(|f| f.name.clone()).collect(),
    ))
}
