//! Handshake parsing and authentication.
//!
//! Implements the connection phase as a small sans-IO exchange shared by the
//! blocking and event-driven connections:
//!
//! 1. [`Handshake::parse`] reads the server greeting.
//! 2. [`Authenticator::start`] answers it with the handshake response.
//! 3. [`Authenticator::on_packet`] consumes every following server packet
//!    until authentication succeeds or fails.
//!
//! Supported plugins:
//!
//! - `mysql_native_password`:
//!   `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
//! - `caching_sha2_password` (fast path):
//!   `XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))`
//!
//! Full `caching_sha2_password` authentication needs an encrypted channel
//! and is reported as an authentication error.

use sha1::Sha1;
use sha2::{Digest, Sha256};
use sqlwire_core::{ConnectionErrorKind, Error, Result};
use tracing::{debug, trace};

use crate::classify::classify;
use crate::config::MySqlConfig;
use crate::protocol::{
    OkPacket, PacketReader, PacketType, PacketWriter, capabilities, charset, frame_payload,
};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
}

/// Status bytes that follow `0x01` during caching_sha2_password.
pub mod caching_sha2 {
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Parsed initial handshake (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Salt: part 1 (8 bytes) followed by part 2, trailing NUL removed
    pub auth_data: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

impl Handshake {
    /// Parse the server greeting.
    ///
    /// A greeting that is truncated or speaks another protocol version is a
    /// fatal `Handshake` connection error. An error packet in place of the
    /// greeting (e.g. "host is blocked") is reported the same way.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let malformed = |what: &str| {
            Error::connection(
                ConnectionErrorKind::Handshake,
                format!("malformed handshake: {what}"),
            )
        };

        if let Some(err) = classify(payload) {
            return Err(Error::connection(
                ConnectionErrorKind::Handshake,
                format!("server refused connection: {err}"),
            ));
        }

        let mut reader = PacketReader::new(payload);
        let protocol_version = reader.read_u8().ok_or_else(|| malformed("empty packet"))?;
        if protocol_version != 10 {
            return Err(malformed(&format!(
                "unsupported protocol version {protocol_version}"
            )));
        }

        let server_version = reader
            .read_null_string()
            .ok_or_else(|| malformed("missing server version"))?;
        let connection_id = reader
            .read_u32_le()
            .ok_or_else(|| malformed("missing connection id"))?;
        let auth_data_1 = reader
            .read_bytes(8)
            .ok_or_else(|| malformed("missing salt"))?;
        if !reader.skip(1) {
            return Err(malformed("missing filler"));
        }
        let caps_lower = reader
            .read_u16_le()
            .ok_or_else(|| malformed("missing capability flags"))?;

        // Everything below is optional for very old servers
        let charset = reader.read_u8().unwrap_or(charset::UTF8_GENERAL_CI);
        let status_flags = reader.read_u16_le().unwrap_or(0);
        let caps_upper = reader.read_u16_le().unwrap_or(0);
        let capabilities = u32::from(caps_lower) | (u32::from(caps_upper) << 16);

        let auth_data_len = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            usize::from(reader.read_u8().unwrap_or(0))
        } else {
            reader.skip(1);
            0
        };
        reader.skip(10);

        let mut auth_data = auth_data_1.to_vec();
        if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
            let len2 = auth_data_len.saturating_sub(8).max(13);
            let part2 = reader
                .read_bytes(len2.min(reader.remaining()))
                .unwrap_or_default();
            auth_data.extend_from_slice(part2.strip_suffix(&[0]).unwrap_or(part2));
        }

        let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            reader
                .read_null_string()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| plugins::MYSQL_NATIVE_PASSWORD.to_string())
        } else {
            plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_data,
            capabilities,
            charset,
            status_flags,
            auth_plugin,
        })
    }
}

/// Compute mysql_native_password authentication response.
///
/// Returns the 20-byte scramble, or an empty vec if the password is empty.
pub fn mysql_native_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = auth_data.get(..20).unwrap_or(auth_data);

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute caching_sha2_password fast authentication response.
///
/// Returns the 32-byte scramble, or an empty vec if the password is empty.
pub fn caching_sha2_password(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    // Servers send the 20-byte scramble followed by NUL
    let seed = if auth_data.len() == 21 && auth_data.last() == Some(&0) {
        &auth_data[..20]
    } else {
        auth_data
    };

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Scramble `password` for `plugin`. Unknown plugins fall back to
/// mysql_native_password.
pub fn scramble(plugin: &str, password: &str, auth_data: &[u8]) -> Vec<u8> {
    match plugin {
        plugins::CACHING_SHA2_PASSWORD => caching_sha2_password(password, auth_data),
        _ => mysql_native_password(password, auth_data),
    }
}

/// What the connection must do after feeding a packet to the authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Authentication succeeded.
    Done(OkPacket),
    /// Write these framed bytes and keep feeding packets.
    Write(Vec<u8>),
    /// Nothing to send; wait for the next packet.
    Wait,
}

/// Client side of the connection phase.
#[derive(Debug, Clone)]
pub struct Authenticator {
    user: String,
    password: String,
    database: Option<String>,
    charset: u8,
    max_packet_size: u32,
    client_flags: u32,
    plugin: String,
    handshake: Option<Handshake>,
}

impl Authenticator {
    pub fn new(config: &MySqlConfig) -> Self {
        Self {
            user: config.user.clone(),
            password: config.password.clone().unwrap_or_default(),
            database: config.database.clone(),
            charset: config.charset,
            max_packet_size: config.max_packet_size,
            client_flags: config.capability_flags(),
            plugin: plugins::MYSQL_NATIVE_PASSWORD.to_string(),
            handshake: None,
        }
    }

    /// The greeting received in [`start`](Self::start), if any.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Parse the greeting and build the framed handshake response.
    pub fn start(&mut self, payload: &[u8], sequence_id: u8) -> Result<Vec<u8>> {
        let handshake = Handshake::parse(payload)?;
        debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            plugin = %handshake.auth_plugin,
            "received handshake"
        );
        if handshake.capabilities & capabilities::CLIENT_PROTOCOL_41 == 0 {
            return Err(Error::connection(
                ConnectionErrorKind::Handshake,
                "server does not support protocol 4.1",
            ));
        }
        self.plugin.clone_from(&handshake.auth_plugin);
        let packet = self.build_auth_packet(&handshake, sequence_id.wrapping_add(1));
        self.handshake = Some(handshake);
        Ok(packet)
    }

    /// Serialize the handshake response:
    /// client flags (4), max packet size (4), charset (1), 23 zero bytes,
    /// user (NUL-terminated), auth response (1-byte length + bytes),
    /// database (NUL-terminated, when set), plugin name (NUL-terminated).
    pub fn build_auth_packet(&self, handshake: &Handshake, sequence_id: u8) -> Vec<u8> {
        let client_flags = self.client_flags & (handshake.capabilities | capabilities::CLIENT_CONNECT_WITH_DB);
        let auth_response = scramble(&handshake.auth_plugin, &self.password, &handshake.auth_data);

        let mut writer = PacketWriter::with_capacity(64 + self.user.len() + auth_response.len());
        writer.write_u32_le(client_flags);
        writer.write_u32_le(self.max_packet_size);
        writer.write_u8(self.charset);
        writer.write_zeros(23);
        writer.write_null_string(&self.user);
        // Scrambles are 20 or 32 bytes
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u8(auth_response.len() as u8);
        writer.write_bytes(&auth_response);
        if client_flags & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            writer.write_null_string(self.database.as_deref().unwrap_or_default());
        }
        if client_flags & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            writer.write_null_string(&handshake.auth_plugin);
        }
        writer.build_packet(sequence_id)
    }

    /// Feed one server packet received after the handshake response.
    pub fn on_packet(&mut self, payload: &[u8], sequence_id: u8) -> Result<AuthStep> {
        let auth_error = |message: String| {
            Error::connection(ConnectionErrorKind::Authentication, message)
        };

        match PacketType::of(payload) {
            PacketType::Ok => PacketReader::new(payload)
                .parse_ok_packet()
                .map(AuthStep::Done)
                .ok_or_else(|| Error::protocol("malformed OK packet", Some(payload))),
            PacketType::Error => {
                let err = classify(payload)
                    .unwrap_or_else(|| Error::protocol("malformed error packet", Some(payload)));
                Err(auth_error(format!("authentication failed: {err}")))
            }
            _ if payload.first() == Some(&0xFE) => {
                // Auth switch request: plugin name, then new salt
                let mut reader = PacketReader::new(&payload[1..]);
                let plugin = reader
                    .read_null_string()
                    .ok_or_else(|| Error::protocol("auth switch without plugin", Some(payload)))?;
                let salt = reader.read_rest();
                let salt = salt.strip_suffix(&[0]).unwrap_or(salt);
                debug!(plugin = %plugin, "auth switch requested");
                let response = scramble(&plugin, &self.password, salt);
                self.plugin = plugin;
                Ok(AuthStep::Write(frame_payload(&response, sequence_id.wrapping_add(1))))
            }
            _ if payload.first() == Some(&0x01) => match payload.get(1) {
                Some(&caching_sha2::FAST_AUTH_SUCCESS) => {
                    trace!("caching_sha2 fast auth succeeded");
                    Ok(AuthStep::Wait)
                }
                Some(&caching_sha2::PERFORM_FULL_AUTH) => Err(auth_error(format!(
                    "{} full authentication requires an encrypted connection",
                    self.plugin
                ))),
                _ => Err(Error::protocol("unexpected auth-more-data packet", Some(payload))),
            },
            _ => Err(Error::protocol("unexpected packet during authentication", Some(payload))),
        }
    }
}
