//! Client side of the MySQL client/server protocol.
//!
//! [`codec`] frames packets and decodes length-encoded primitives,
//! [`reader`] and [`writer`] walk payload fields, and [`prepared`] builds the
//! `COM_STMT_*` commands. This module holds the protocol constants and the
//! small response types shared by both connection kinds.

pub mod codec;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use codec::{
    Frame, FrameTooShort, PacketHeader, decode_header, encode_header, length_encoded_bytes,
    length_encoded_int, length_encoded_string, split_packet,
};
pub use prepared::{
    StmtPrepareOk, build_stmt_close_packet, build_stmt_execute_packet, build_stmt_prepare_packet,
    parse_stmt_prepare_ok,
};
pub use reader::PacketReader;
pub use writer::{PacketWriter, build_command_packet, frame_payload};

/// Largest payload one physical packet carries; a payload of exactly this
/// length continues in the next packet.
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability bits exchanged during the handshake.
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    /// Never requested: result sets here always end in EOF packets.
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Requested on every connection. `CLIENT_CONNECT_WITH_DB` is added
    /// when a database is configured.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;
}

/// First payload byte of each command this driver sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Ping = 0x0e,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    /// Has no reply
    StmtClose = 0x19,
}

/// Bits of the status word in OK and EOF packets.
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// Collation ids.
pub mod charset {
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    /// Columns in this collation hold raw bytes.
    pub const BINARY: u8 = 63;

    pub const DEFAULT_CHARSET: u8 = UTF8MB4_GENERAL_CI;
}

/// What a response payload is, judged by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Ok,
    Error,
    /// `0xFE` with exactly five bytes; longer `0xFE` payloads are data
    Eof,
    /// `LOCAL INFILE` request, which this driver refuses
    LocalInfile,
    /// Column counts, definitions and rows
    Data,
}

impl PacketType {
    pub fn of(payload: &[u8]) -> Self {
        match (payload.first(), payload.len()) {
            (Some(0x00), _) => Self::Ok,
            (Some(0xFF), _) => Self::Error,
            (Some(0xFE), 5) => Self::Eof,
            (Some(0xFB), _) => Self::LocalInfile,
            _ => Self::Data,
        }
    }
}

pub fn is_eof_packet(payload: &[u8]) -> bool {
    PacketType::of(payload) == PacketType::Eof
}

/// Decoded OK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Decoded ERR packet. `sql_state` is absent when the server omits the
/// `#` marker (pre-4.1 style errors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: Option<String>,
    pub error_message: String,
}

/// Decoded EOF packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_detection() {
        assert_eq!(PacketType::of(&[0x00, 0, 0, 2, 0, 0, 0]), PacketType::Ok);
        assert_eq!(PacketType::of(&[0xFF, 0x15, 0x04]), PacketType::Error);
        assert_eq!(PacketType::of(&[0xFE, 0, 0, 2, 0]), PacketType::Eof);
        assert_eq!(PacketType::of(&[0xFE, 0, 0, 2, 0, 0]), PacketType::Data);
        assert_eq!(PacketType::of(&[0xFB, b'f']), PacketType::LocalInfile);
        assert_eq!(PacketType::of(&[0x02]), PacketType::Data);
        assert_eq!(PacketType::of(&[]), PacketType::Data);
    }

    #[test]
    fn test_eof_more_results_flag() {
        let eof = EofPacket {
            warnings: 0,
            status_flags: server_status::SERVER_MORE_RESULTS_EXISTS
                | server_status::SERVER_STATUS_IN_TRANS,
        };
        assert!(eof.has_more_results());
        assert!(!EofPacket { warnings: 0, status_flags: 0 }.has_more_results());
        assert!(is_eof_packet(&[0xFE, 0, 0, 0x0A, 0]));
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(Command::Query as u8, 0x03);
        assert_eq!(Command::StmtClose as u8, 0x19);
    }
}
