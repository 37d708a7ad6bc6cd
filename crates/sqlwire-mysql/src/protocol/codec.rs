//! Packet framing and length-encoded primitives.
//!
//! Everything here is a pure function over byte slices. Callers that own a
//! receive buffer use [`decode_header`] and [`split_packet`] to find out
//! whether a complete packet is available yet; [`FrameTooShort`] means "wait
//! for more bytes", never "the stream is broken".

use super::MAX_PACKET_SIZE;

/// Length and sequence id of one physical packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_length: u32,
    pub sequence_id: u8,
}

impl PacketHeader {
    pub const SIZE: usize = 4;

    fn parse([a, b, c, sequence_id]: [u8; 4]) -> Self {
        Self {
            payload_length: u24_from_le([a, b, c]),
            sequence_id,
        }
    }
}

/// Not enough bytes buffered to decode the requested frame or integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTooShort {
    /// Bytes required to make progress
    pub needed: usize,
    /// Bytes that were available
    pub available: usize,
}

impl std::fmt::Display for FrameTooShort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame too short: need {} bytes, have {}",
            self.needed, self.available
        )
    }
}

impl std::error::Error for FrameTooShort {}

/// Marker byte for a NULL length-encoded value.
pub const LENENC_NULL: u8 = 0xFB;

/// Encode a packet header.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_header(payload_length: usize, sequence_id: u8) -> [u8; 4] {
    let [a, b, c] = u24_to_le(payload_length as u32);
    [a, b, c, sequence_id]
}

/// Decode a packet header, returning the header and the bytes after it.
pub fn decode_header(bytes: &[u8]) -> Result<(PacketHeader, &[u8]), FrameTooShort> {
    match bytes.split_first_chunk::<4>() {
        Some((head, rest)) => Ok((PacketHeader::parse(*head), rest)),
        None => Err(FrameTooShort {
            needed: PacketHeader::SIZE,
            available: bytes.len(),
        }),
    }
}

/// A complete logical packet extracted from a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence id of the last physical packet
    pub sequence_id: u8,
    /// Reassembled payload
    pub payload: Vec<u8>,
    /// Bytes of the buffer this frame occupied (headers included)
    pub consumed: usize,
}

/// Try to take one complete logical packet from the front of `bytes`.
///
/// Payloads of exactly `MAX_PACKET_SIZE` continue in the next physical packet;
/// they are joined here. A header that announces more bytes than are buffered
/// yields `FrameTooShort` and leaves the caller's buffer untouched. Nothing is
/// copied until every fragment of the packet is buffered.
pub fn split_packet(bytes: &[u8]) -> Result<Frame, FrameTooShort> {
    let mut fragments = Vec::new();
    let mut offset = 0;
    let sequence_id = loop {
        let (header, rest) = decode_header(&bytes[offset..]).map_err(|e| FrameTooShort {
            needed: offset + e.needed,
            available: bytes.len(),
        })?;
        let len = header.payload_length as usize;
        if rest.len() < len {
            return Err(FrameTooShort {
                needed: offset + PacketHeader::SIZE + len,
                available: bytes.len(),
            });
        }
        let start = offset + PacketHeader::SIZE;
        fragments.push(start..start + len);
        offset = start + len;
        if len < MAX_PACKET_SIZE {
            break header.sequence_id;
        }
    };

    let total = fragments.iter().map(|range| range.len()).sum();
    let mut payload = Vec::with_capacity(total);
    for range in fragments {
        payload.extend_from_slice(&bytes[range]);
    }
    Ok(Frame {
        sequence_id,
        payload,
        consumed: offset,
    })
}

/// Decode a length-encoded integer.
///
/// Returns the value (`None` for the `0xFB` NULL marker) and the number of
/// bytes consumed: 1 for values below `0xFB` and for NULL, 3/4/9 for the
/// `0xFC`/`0xFD`/`0xFE` forms.
pub fn length_encoded_int(bytes: &[u8]) -> Result<(Option<u64>, usize), FrameTooShort> {
    let short = |needed| FrameTooShort {
        needed,
        available: bytes.len(),
    };
    let first = *bytes.first().ok_or(short(1))?;
    let width = match first {
        0x00..=0xFA => return Ok((Some(u64::from(first)), 1)),
        LENENC_NULL => return Ok((None, 1)),
        0xFC => 2,
        0xFD => 3,
        0xFE => 8,
        // 0xFF starts an error packet, never an integer
        0xFF => return Ok((None, 1)),
    };
    let body = bytes.get(1..=width).ok_or(short(1 + width))?;
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(body);
    Ok((Some(u64::from_le_bytes(buf)), 1 + width))
}

/// Decode a length-encoded string as raw bytes.
///
/// Returns `None` for NULL along with the bytes consumed.
pub fn length_encoded_bytes(bytes: &[u8]) -> Result<(Option<&[u8]>, usize), FrameTooShort> {
    let (len, prefix) = length_encoded_int(bytes)?;
    let Some(len) = len else {
        return Ok((None, prefix));
    };
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    let end = prefix.saturating_add(len);
    match bytes.get(prefix..end) {
        Some(body) => Ok((Some(body), end)),
        None => Err(FrameTooShort {
            needed: end,
            available: bytes.len(),
        }),
    }
}

/// Decode a length-encoded string as UTF-8 (lossy).
pub fn length_encoded_string(bytes: &[u8]) -> Result<(Option<String>, usize), FrameTooShort> {
    let (body, consumed) = length_encoded_bytes(bytes)?;
    Ok((
        body.map(|b| String::from_utf8_lossy(b).into_owned()),
        consumed,
    ))
}

/// Encode a length-encoded integer.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_length_encoded_int(value: u64, out: &mut Vec<u8>) {
    if value < 0xFB {
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(0xFC);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFF_FFFF {
        out.push(0xFD);
        out.extend_from_slice(&u24_to_le(value as u32));
    } else {
        out.push(0xFE);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Read a 3-byte little-endian integer.
pub fn u24_from_le(bytes: [u8; 3]) -> u32 {
    u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16)
}

/// Write the low 24 bits of `value` as 3 little-endian bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn u24_to_le(value: u32) -> [u8; 3] {
    [value as u8, (value >> 8) as u8, (value >> 16) as u8]
}
