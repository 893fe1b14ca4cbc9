//! Error types
//!
//! Errors fall into four groups that decide how a connection ends:
//! transport failures (peer gone, timeout), protocol violations (bad
//! handshake, inconsistent chunk headers, undecodable command values),
//! resource conflicts (stream busy, bad stream name) and registry errors.

use std::io;
use std::time::Duration;

use crate::registry::RegistryError;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("amf error: {0}")]
    Amf(#[from] AmfError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl Error {
    /// Peer went away or stopped talking; nothing wrong with our state.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Timeout(_) | Error::ConnectionClosed
        )
    }

    /// The peer sent bytes that cannot be interpreted.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::Handshake(_) | Error::Protocol(_) | Error::Amf(_)
        )
    }
}

impl From<OutOfBounds> for Error {
    fn from(e: OutOfBounds) -> Self {
        Error::Protocol(ProtocolError::Truncated(e))
    }
}

/// Bounds violation inside a [`ByteReader`](crate::protocol::cursor::ByteReader)
/// or [`ByteWriter`](crate::protocol::cursor::ByteWriter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cursor out of bounds: need {needed} bytes at {position}, have {available}")]
pub struct OutOfBounds {
    pub position: usize,
    pub needed: usize,
    pub available: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported rtmp version {0}, only plaintext version 3 is accepted")]
    InvalidVersion(u8),

    #[error("handshake packet called in wrong state")]
    InvalidState,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated packet: {0}")]
    Truncated(#[from] OutOfBounds),

    #[error("chunk stream {csid} must start with a fmt0 header, got fmt{fmt}")]
    InvalidFirstChunk { csid: u32, fmt: u8 },

    #[error("chunk stream {csid} got fmt0 while a message of {partial} bytes is in progress")]
    ChunkInterrupted { csid: u32, partial: usize },

    #[error("chunk stream {csid} changed payload length from {expected} to {actual} mid-message")]
    PayloadLengthChanged {
        csid: u32,
        expected: u32,
        actual: u32,
    },

    #[error("chunk size {0} outside [128, 65535]")]
    InvalidChunkSize(u32),

    #[error("response for unknown transaction id {0}")]
    UnknownTransaction(f64),

    #[error("malformed {command} command: {reason}")]
    MalformedCommand {
        command: String,
        reason: &'static str,
    },

    #[error("unexpected message type {0}")]
    UnexpectedMessage(u8),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmfError {
    #[error("unexpected end of amf data")]
    UnexpectedEof,

    #[error("unknown amf0 marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("invalid utf-8 in amf string")]
    InvalidUtf8,

    #[error("amf nesting too deep")]
    NestingTooDeep,
}

impl From<OutOfBounds> for AmfError {
    fn from(_: OutOfBounds) -> Self {
        AmfError::UnexpectedEof
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("stream {0} is busy, another publisher owns it")]
    StreamBusy(String),

    #[error("media received on {0} while not publishing")]
    NotPublishing(String),

    #[error("empty stream name")]
    EmptyStreamName,
}
