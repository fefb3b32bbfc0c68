//! Frame serialization
//!
//! The inverse of parser + collector: encodes queued frames into a bounded
//! output buffer. A frame that does not fit is written partially and resumed
//! on the next [`Serializer::serialize`] call without re-emitting bytes.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Frame, OpCode};
use crate::mask::{apply_mask_offset, generate_mask};
use crate::{MAX_FRAME_HEADER_SIZE, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// Default number of frames the serializer accepts before reporting no capacity
pub const DEFAULT_SERIALIZER_CAPACITY: usize = 16;

/// Encode a frame header into `out`, returning the header length
#[inline]
pub fn encode_header(
    out: &mut [u8; MAX_FRAME_HEADER_SIZE],
    opcode: OpCode,
    payload_len: usize,
    fin: bool,
    mask: Option<[u8; 4]>,
) -> usize {
    // First byte: FIN + opcode
    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    out[0] = b0;

    // Second byte: mask flag + length
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let mut len = if payload_len <= SMALL_MESSAGE_THRESHOLD {
        out[1] = mask_bit | payload_len as u8;
        2
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        out[1] = mask_bit | 126;
        out[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        4
    } else {
        out[1] = mask_bit | 127;
        out[2..10].copy_from_slice(&(payload_len as u64).to_be_bytes());
        10
    };

    if let Some(m) = mask {
        out[len..len + 4].copy_from_slice(&m);
        len += 4;
    }
    len
}

/// Encode a whole frame into a buffer
///
/// One-shot path used outside the writer loop; the payload is copied and
/// masked when `mask` is given.
pub fn encode_frame(buf: &mut BytesMut, frame: &Frame, mask: Option<[u8; 4]>) {
    let mut header = [0u8; MAX_FRAME_HEADER_SIZE];
    let header_len = encode_header(
        &mut header,
        frame.opcode(),
        frame.payload().len(),
        frame.is_final(),
        mask,
    );

    buf.reserve(header_len + frame.payload().len());
    buf.put_slice(&header[..header_len]);

    let start = buf.len();
    buf.put_slice(frame.payload());
    if let Some(m) = mask {
        apply_mask_offset(&mut buf[start..], m, 0);
    }
}

/// A frame being written, possibly across several serialize calls
#[derive(Debug)]
struct Encoding {
    header: [u8; MAX_FRAME_HEADER_SIZE],
    header_len: usize,
    header_written: usize,
    payload: Bytes,
    payload_written: usize,
    mask: Option<[u8; 4]>,
}

impl Encoding {
    fn new(frame: Frame, masking: bool) -> Self {
        let mask = if masking { Some(generate_mask()) } else { None };
        let mut header = [0u8; MAX_FRAME_HEADER_SIZE];
        let header_len = encode_header(
            &mut header,
            frame.opcode(),
            frame.payload().len(),
            frame.is_final(),
            mask,
        );
        Self {
            header,
            header_len,
            header_written: 0,
            payload: frame.into_payload(),
            payload_written: 0,
            mask,
        }
    }

    /// Write as much as fits into `buf` without exceeding `limit` total
    /// bytes. Returns true once the frame is fully written.
    fn write(&mut self, buf: &mut BytesMut, limit: usize) -> bool {
        if self.header_written < self.header_len {
            let room = limit.saturating_sub(buf.len());
            let n = room.min(self.header_len - self.header_written);
            buf.put_slice(&self.header[self.header_written..self.header_written + n]);
            self.header_written += n;
            if self.header_written < self.header_len {
                return false;
            }
        }

        let room = limit.saturating_sub(buf.len());
        let n = room.min(self.payload.len() - self.payload_written);
        if n > 0 {
            let start = buf.len();
            buf.put_slice(&self.payload[self.payload_written..self.payload_written + n]);
            if let Some(m) = self.mask {
                apply_mask_offset(&mut buf[start..], m, self.payload_written);
            }
            self.payload_written += n;
        }

        self.payload_written == self.payload.len()
    }
}

/// Frame serializer with a pending queue
#[derive(Debug)]
pub struct Serializer {
    pending: VecDeque<Frame>,
    current: Option<Encoding>,
    masking: bool,
    buffer_size: usize,
    capacity: usize,
}

impl Serializer {
    /// Create a serializer that fills at most `buffer_size` bytes per call
    pub fn new(masking: bool, buffer_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            masking,
            buffer_size: buffer_size.max(MAX_FRAME_HEADER_SIZE),
            capacity: DEFAULT_SERIALIZER_CAPACITY,
        }
    }

    /// Whether outgoing frames are masked
    #[inline]
    pub fn masking(&self) -> bool {
        self.masking
    }

    /// Append a frame to the pending list
    pub fn enqueue(&mut self, frame: Frame) {
        self.pending.push_back(frame);
    }

    /// Whether more frames may be enqueued before the next serialize
    #[inline]
    pub fn has_capacity(&self) -> bool {
        self.pending.len() < self.capacity
    }

    /// Whether a frame is only partially written
    #[inline]
    pub fn has_outstanding_bytes(&self) -> bool {
        self.current.is_some()
    }

    /// Whether nothing is left to write
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Encode pending frames into `buf` until it holds `buffer_size` bytes
    ///
    /// Returns the number of bytes appended.
    pub fn serialize(&mut self, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        let limit = start + self.buffer_size;

        while buf.len() < limit {
            let mut encoding = match self.current.take() {
                Some(encoding) => encoding,
                None => match self.pending.pop_front() {
                    Some(frame) => Encoding::new(frame, self.masking),
                    None => break,
                },
            };

            if !encoding.write(buf, limit) {
                self.current = Some(encoding);
                break;
            }
        }

        buf.len() - start
    }
}
