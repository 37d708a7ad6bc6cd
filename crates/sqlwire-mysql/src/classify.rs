//! Error packet classification.
//!
//! Server error codes live below 2000 (`ER_*`), client library codes above
//! (`CR_*`). A server error only fails the current command; a client error
//! means the local protocol state is no longer trustworthy.

use sqlwire_core::error::{ClientError, ClientErrorKind, CR_COMMANDS_OUT_OF_SYNC, ServerError};
use sqlwire_core::Error;

use crate::protocol::{ErrPacket, PacketReader};

/// Codes above this are client errors.
pub const CLIENT_ERROR_THRESHOLD: u16 = 2000;

/// Classify a response payload.
///
/// Returns `None` when the payload is not an error packet (first byte is not
/// `0xFF`). A truncated error packet is reported as a protocol error.
pub fn classify(payload: &[u8]) -> Option<Error> {
    if payload.first() != Some(&0xFF) {
        return None;
    }
    Some(match PacketReader::new(payload).parse_err_packet() {
        Some(packet) => from_err_packet(packet),
        None => Error::protocol("truncated error packet", Some(payload)),
    })
}

/// Convert a parsed error packet into a client or server error.
pub fn from_err_packet(packet: ErrPacket) -> Error {
    if packet.error_code > CLIENT_ERROR_THRESHOLD {
        let kind = if packet.error_code == CR_COMMANDS_OUT_OF_SYNC {
            ClientErrorKind::CommandsOutOfSync
        } else {
            ClientErrorKind::Other
        };
        Error::Client(ClientError {
            kind,
            code: packet.error_code,
            message: packet.error_message,
        })
    } else {
        Error::Server(ServerError {
            code: packet.error_code,
            sql_state: packet.sql_state,
            message: packet.error_message,
            sql: None,
        })
    }
}
