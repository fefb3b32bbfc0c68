//! Incremental frame header parser
//!
//! The parser decodes the header, extended length and mask key of a frame
//! from a byte buffer, independent of where buffer boundaries fall. It only
//! consumes a field once all of its bytes are available, so a partial field
//! stays in the caller's buffer until the next read appends to it.
//!
//! Once [`FrameParser::body_ready`] reports true, the caller reads the
//! decoded fields, collects `length` payload bytes elsewhere and then calls
//! [`FrameParser::body_complete`] to go back to header decoding.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::frame::OpCode;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// Parser decode stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Waiting for the 2 base header bytes
    Header,
    /// Waiting for the extended payload length (0, 2 or 8 bytes)
    Length,
    /// Waiting for the 4 byte mask key
    MaskKey,
    /// Header complete, payload is collected by the caller
    Body,
}

/// Frame header parser state machine
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    fin: bool,
    opcode: OpCode,
    masked: bool,
    /// Raw 7-bit length field of the current header
    length_field: u8,
    length: u64,
    mask_key: Option<[u8; 4]>,
    /// Opcode of the message the next continuation frame belongs to
    last_opcode: Option<OpCode>,
    /// A non-final Text/Binary frame was seen and its terminal fragment was not
    in_message: bool,
    max_frame_size: usize,
    /// Whether incoming frames must be masked (server side)
    expect_masked: bool,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            state: ParseState::Header,
            fin: false,
            opcode: OpCode::Continuation,
            masked: false,
            length_field: 0,
            length: 0,
            mask_key: None,
            last_opcode: None,
            in_message: false,
            max_frame_size,
            expect_masked,
        }
    }

    /// Decode as many header fields as `buf` allows
    ///
    /// Never blocks and never consumes a partially available field. Returns
    /// immediately once the header is complete; payload bytes are left in
    /// `buf` for the collector.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<()> {
        loop {
            match self.state {
                ParseState::Header => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    let b0 = buf[0];
                    let b1 = buf[1];
                    self.decode_base_header(b0, b1)?;
                    buf.advance(2);
                    self.state = ParseState::Length;
                }

                ParseState::Length => {
                    let length = match self.length_field {
                        126 => {
                            if buf.len() < 2 {
                                return Ok(());
                            }
                            let len = buf.get_u16() as u64;
                            if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                                return Err(Error::Protocol("payload length not minimal"));
                            }
                            len
                        }
                        127 => {
                            if buf.len() < 8 {
                                return Ok(());
                            }
                            let len = buf.get_u64();
                            if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                                return Err(Error::Protocol("payload length not minimal"));
                            }
                            if len >> 63 != 0 {
                                return Err(Error::Protocol("payload length MSB must be 0"));
                            }
                            len
                        }
                        small => small as u64,
                    };
                    self.check_length(length)?;
                    self.length = length;
                    self.state = if self.masked {
                        ParseState::MaskKey
                    } else {
                        ParseState::Body
                    };
                }

                ParseState::MaskKey => {
                    if buf.len() < 4 {
                        return Ok(());
                    }
                    let mut key = [0u8; 4];
                    buf.copy_to_slice(&mut key);
                    self.mask_key = Some(key);
                    self.state = ParseState::Body;
                }

                ParseState::Body => return Ok(()),
            }
        }
    }

    fn decode_base_header(&mut self, b0: u8, b1: u8) -> Result<()> {
        let fin = b0 & 0x80 != 0;

        // No extension negotiated at this layer
        if b0 & 0x70 != 0 {
            return Err(Error::Protocol("RSV bits must be 0"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::InvalidFrame("invalid opcode"))?;

        if opcode.is_control() && !fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }

        let masked = b1 & 0x80 != 0;
        if self.expect_masked && !masked {
            return Err(Error::Protocol("client frames must be masked"));
        }
        if !self.expect_masked && masked {
            return Err(Error::Protocol("server frames must not be masked"));
        }

        match opcode {
            OpCode::Continuation => {
                if !self.in_message {
                    return Err(Error::Protocol("unexpected continuation frame"));
                }
                self.in_message = !fin;
            }
            OpCode::Text | OpCode::Binary => {
                if self.in_message {
                    return Err(Error::Protocol("expected continuation frame"));
                }
                self.last_opcode = Some(opcode);
                self.in_message = !fin;
            }
            // Control frames may interleave and leave the message state alone
            OpCode::Close | OpCode::Ping | OpCode::Pong => {}
        }

        self.fin = fin;
        self.opcode = opcode;
        self.masked = masked;
        self.length_field = b1 & 0x7F;
        Ok(())
    }

    fn check_length(&self, length: u64) -> Result<()> {
        if self.opcode.is_control() && length > SMALL_MESSAGE_THRESHOLD as u64 {
            return Err(Error::Protocol("control frame too large"));
        }
        if usize::try_from(length).is_err() {
            return Err(Error::FrameTooBig {
                size: length,
                max: self.max_frame_size,
            });
        }
        if length > self.max_frame_size as u64 {
            return Err(Error::FrameTooBig {
                size: length,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Whether a full header has been decoded
    #[inline]
    pub fn body_ready(&self) -> bool {
        self.state == ParseState::Body
    }

    /// Whether the parser sits between frames
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == ParseState::Header
    }

    /// Declared payload length of the current frame
    #[inline]
    pub fn length(&self) -> usize {
        // check_length guarantees the value fits
        self.length as usize
    }

    /// Mask key of the current frame, if masked
    #[inline]
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask_key
    }

    /// FIN flag of the current frame
    #[inline]
    pub fn fin(&self) -> bool {
        self.fin
    }

    /// Opcode of the current frame as it appeared on the wire
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Frame type of the current frame, continuation resolved to the
    /// opcode of the message it continues
    #[inline]
    pub fn frame_type(&self) -> OpCode {
        match self.opcode {
            OpCode::Continuation => self.last_opcode.unwrap_or(OpCode::Continuation),
            other => other,
        }
    }

    /// Reset after the current frame's payload was collected
    ///
    /// The message-level opcode survives so later continuations resolve.
    pub fn body_complete(&mut self) {
        self.state = ParseState::Header;
        self.fin = false;
        self.opcode = OpCode::Continuation;
        self.masked = false;
        self.length_field = 0;
        self.length = 0;
        self.mask_key = None;
    }
}
