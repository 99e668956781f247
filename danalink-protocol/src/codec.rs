//! Receive accumulator and write chunking.

use crate::frame::{Frame, ParseOutcome};
use bytes::{Bytes, BytesMut};

/// Default transport write limit in bytes.
pub const DEFAULT_WRITE_LIMIT: usize = 20;

/// Splits an encoded frame into transport-sized writes.
pub struct Encoder;

impl Encoder {
    /// Splits `data` into chunks of at most `limit` bytes, in order.
    ///
    /// A zero limit is treated as one byte per write.
    pub fn chunks(data: &[u8], limit: usize) -> Vec<Bytes> {
        data.chunks(limit.max(1))
            .map(Bytes::copy_from_slice)
            .collect()
    }
}

/// Collects transport fragments until complete frames can be extracted.
#[derive(Debug)]
pub struct ReceiveAccumulator {
    buffer: BytesMut,
}

impl ReceiveAccumulator {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to extract the next frame from the buffer.
    pub fn decode_frame(&mut self) -> ParseOutcome {
        Frame::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ReceiveAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
