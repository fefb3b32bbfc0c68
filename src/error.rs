//! Error types for the WebSocket wire engine

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
///
/// Errors are `Clone` so that a single close cause can be handed to every
/// caller still waiting on a queue when it shuts down.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O error from the underlying byte source or sink
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    /// Invalid WebSocket frame (unknown opcode)
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Protocol violation
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    /// Declared frame (or reassembled message) size exceeds the configured limit
    #[error("Frame is too big: {size}. Max size is {max}")]
    FrameTooBig {
        /// Offending size in bytes
        size: u64,
        /// Configured maximum
        max: usize,
    },
    /// Invalid UTF-8 in a text frame or close reason
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// Close frame payload is malformed
    #[error("Invalid close frame payload")]
    InvalidClosePayload,
    /// The queue or the underlying stream is closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// Session was already started
    #[error("Session is already started")]
    AlreadyStarted,
}

impl Error {
    /// Returns true when the underlying byte stream failed
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed)
    }

    /// Returns true for errors that mean the peer spoke invalid WebSocket
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::InvalidFrame(_)
                | Error::Protocol(_)
                | Error::FrameTooBig { .. }
                | Error::InvalidUtf8
                | Error::InvalidClosePayload
        )
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Reason text (may be empty)
    pub message: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const CANNOT_ACCEPT: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure, never sent on the wire
    pub const CLOSED_ABNORMALLY: u16 = 1006;
    /// Invalid frame payload
    pub const NOT_CONSISTENT: u16 = 1007;
    /// Policy violation
    pub const VIOLATED_POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension missing
    pub const NO_EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Service restart
    pub const SERVICE_RESTART: u16 = 1012;
    /// Try again later
    pub const TRY_AGAIN_LATER: u16 = 1013;

    /// Create a new close reason
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Normal closure with an empty message
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    /// Check if the close code may be sent on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1013 | 3000..=4999)
    }

    /// Encode as close frame payload: big-endian code followed by the message
    pub fn encode(&self) -> bytes::Bytes {
        let mut payload = Vec::with_capacity(2 + self.message.len());
        payload.extend_from_slice(&self.code.to_be_bytes());
        payload.extend_from_slice(self.message.as_bytes());
        payload.into()
    }

    /// Parse a close frame payload
    ///
    /// Empty payload carries no reason. A single byte is malformed.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(Error::InvalidClosePayload),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                let message = std::str::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
                Ok(Some(Self::new(code, message)))
            }
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CloseReason(code={}, message={})", self.code, self.message)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(Arc::new(e)),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => io::Error::new(e.kind(), e.to_string()),
            Error::ConnectionClosed => io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"),
            other if other.is_protocol() => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
            other => io::Error::other(other.to_string()),
        }
    }
}
