//! Frame payload collector
//!
//! Accumulates a frame's payload, which may arrive across many reads, and
//! unmasks it once complete. When the whole payload is already buffered the
//! bytes are split off without copying.

use bytes::{Buf, Bytes, BytesMut};

use crate::mask::apply_mask;

/// Payload accumulator for a single frame
#[derive(Debug, Default)]
pub struct FrameCollector {
    /// Target payload length
    length: usize,
    /// Destination buffer, `len()` is the number of bytes written so far
    data: BytesMut,
}

impl FrameCollector {
    /// Create an idle collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Target a payload of `length` bytes and take what `source` already holds
    pub fn start(&mut self, length: usize, source: &mut BytesMut) {
        self.length = length;

        if source.len() >= length {
            self.data = source.split_to(length);
            return;
        }

        self.data = BytesMut::with_capacity(length);
        self.handle(source);
    }

    /// Copy further available bytes from `source`
    pub fn handle(&mut self, source: &mut BytesMut) {
        let wanted = self.length - self.data.len();
        let n = wanted.min(source.len());
        if n == 0 {
            return;
        }
        self.data.extend_from_slice(&source[..n]);
        source.advance(n);
    }

    /// Whether more bytes are needed to complete the payload
    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.data.len() < self.length
    }

    /// Take the completed payload, unmasking it when a key is given
    pub fn take(&mut self, mask_key: Option<[u8; 4]>) -> Bytes {
        let mut data = std::mem::take(&mut self.data);
        self.length = 0;
        if let Some(key) = mask_key {
            apply_mask(&mut data, key);
        }
        data.freeze()
    }
}
