//! WebSocket frame model
//!
//! A [`Frame`] is the unit of wire exchange: an opcode, a FIN flag and an
//! owned payload. Frames are immutable once built; the reader produces them
//! and the serializer consumes them.

use bytes::Bytes;

use crate::error::{CloseReason, Error, Result};
use crate::SMALL_MESSAGE_THRESHOLD;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A complete WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: OpCode,
    fin: bool,
    payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            opcode,
            fin,
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a continuation frame
    #[inline]
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, data.into(), fin)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame carrying `reason`
    #[inline]
    pub fn close(reason: &CloseReason) -> Self {
        Self::new(OpCode::Close, reason.encode(), true)
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Frame opcode as it appears on the wire
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.fin
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Payload bytes (already unmasked)
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame and return its payload
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Get the payload as a string (for text frames)
    pub fn as_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|_| Error::InvalidUtf8)
    }

    /// Parse the close reason of a close frame
    ///
    /// Returns `Ok(None)` for non-close frames and for close frames without
    /// a status code.
    pub fn close_reason(&self) -> Result<Option<CloseReason>> {
        if self.opcode != OpCode::Close {
            return Ok(None);
        }
        CloseReason::parse(&self.payload)
    }

    /// Check the control frame constraints (FIN set, payload ≤ 125 bytes)
    pub fn validate(&self) -> Result<()> {
        if self.is_control() {
            if !self.fin {
                return Err(Error::Protocol("control frame must not be fragmented"));
            }
            if self.payload.len() > SMALL_MESSAGE_THRESHOLD {
                return Err(Error::Protocol("control frame too large"));
            }
        }
        Ok(())
    }
}
