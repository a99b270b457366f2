//! Per-slot delay buffer
//!
//! The drain path moves items out of a ring as soon as the wake signal
//! fires, but the application consumes them later at its own pace. The
//! delay buffer holds that backlog as one contiguous FIFO byte stream;
//! item boundaries are the application's concern. Growth is dynamic up
//! to an explicit maximum; appending past the maximum is an error the
//! caller handles by leaving items in the ring as backpressure.

use bytes::{BufMut, Bytes, BytesMut};
use shmbus_core::{BusError, Result};

/// FIFO byte backlog of drained items, bounded by a hard byte limit
#[derive(Debug)]
pub struct DelayBuffer {
    buf: BytesMut,
    max: usize,
}

impl DelayBuffer {
    pub fn new(initial: usize, max: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(initial.min(max)),
            max,
        }
    }

    /// Append bytes behind everything already buffered
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let needed = self.buf.len() + bytes.len();
        if needed > self.max {
            return Err(BusError::DelayOverflow {
                needed,
                max: self.max,
            });
        }
        self.buf.put_slice(bytes);
        Ok(())
    }

    /// Take up to `max` bytes off the front
    pub fn read_bytes(&mut self, max: usize) -> Bytes {
        let n = max.min(self.buf.len());
        let out = self.buf.split_to(n).freeze();
        if self.buf.is_empty() {
            // Let a drained buffer shed large one-off allocations
            self.buf = BytesMut::new();
        }
        out
    }

    pub fn bytes_available(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether `len` more bytes would fit
    pub fn has_room_for(&self, len: usize) -> bool {
        self.buf.len() + len <= self.max
    }
}
