//! Blocking byte-stream transport and packet stream.
//!
//! [`Transport`] is the narrow socket contract the blocking connection is
//! written against; [`TcpTransport`] implements it over `std::net`. The
//! [`PacketStream`] on top turns arbitrary read chunks into whole packets.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use asupersync::bytes::BytesMut;
use sqlwire_core::{ConnectionError, ConnectionErrorKind, Error, Result};
use tracing::trace;

use crate::classify::classify;
use crate::config::MySqlConfig;
use crate::protocol::{Frame, is_eof_packet, split_packet};

/// A blocking, bidirectional byte stream.
pub trait Transport: Send {
    /// Establish the underlying connection.
    fn open(&mut self) -> io::Result<()>;

    /// Read at most `up_to` bytes. An empty result means the peer closed.
    fn read(&mut self, up_to: usize) -> io::Result<Vec<u8>>;

    /// Write all of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// TCP transport built on `std::net::TcpStream`.
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            stream: None,
        }
    }

    pub fn from_config(config: &MySqlConfig) -> Self {
        Self::new(config.socket_addr(), config.connect_timeout)
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is not open"))
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> io::Result<()> {
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing")
        }))
    }

    fn read(&mut self, up_to: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; up_to.max(1)];
        let n = self.stream()?.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.stream()?;
        stream.write_all(bytes)?;
        stream.flush()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

/// Reads whole packets from a [`Transport`], buffering partial deliveries.
#[derive(Debug)]
pub struct PacketStream<T> {
    transport: T,
    buffer: BytesMut,
    read_size: usize,
}

impl<T: Transport> PacketStream<T> {
    pub fn new(transport: T, read_size: usize) -> Self {
        Self {
            transport,
            buffer: BytesMut::with_capacity(read_size),
            read_size: read_size.max(4),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Read the next logical packet, returning its payload and sequence id.
    pub fn read_packet(&mut self) -> Result<(Vec<u8>, u8)> {
        loop {
            if let Ok(Frame {
                sequence_id,
                payload,
                consumed,
            }) = split_packet(&self.buffer)
            {
                let _ = self.buffer.split_to(consumed);
                trace!(len = payload.len(), seq = sequence_id, "read packet");
                return Ok((payload, sequence_id));
            }
            self.fill()?;
        }
    }

    /// Read and discard packets up to and including the next EOF.
    pub fn skip_until_eof(&mut self) -> Result<()> {
        loop {
            let (payload, _) = self.read_packet()?;
            if let Some(err) = classify(&payload) {
                return Err(err);
            }
            if is_eof_packet(&payload) {
                return Ok(());
            }
        }
    }

    /// Write already-framed bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(len = bytes.len(), "write");
        self.transport.write(bytes).map_err(|e| disconnected("write failed", e))
    }

    fn fill(&mut self) -> Result<()> {
        let chunk = self
            .transport
            .read(self.read_size)
            .map_err(|e| disconnected("read failed", e))?;
        if chunk.is_empty() {
            return Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection closed by server",
            ));
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    pub fn close(&mut self) {
        self.buffer.clear();
        self.transport.close();
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

fn disconnected(message: &str, source: io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("{message}: {source}"),
        source: Some(Box::new(source)),
    })
}
