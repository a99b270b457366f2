//! Fixed binary layout of one ring direction in shared memory
//!
//! Each region is two halves of `REGION_PAGE` bytes. The first half
//! starts with this header; the second half is the flat data arena the
//! descriptors point into. Field order and widths are fixed:
//!
//! ```text
//! offset  width  field
//! 0       u32    magic ("SBUS", written last by the creator)
//! 4       u16    ack counter          (written by the consumer)
//! 6       u16    last_ack counter     (written by the consumer)
//! 8       u16    update counter       (written by the producer)
//! 10      u16    last_update counter  (written by the producer)
//! 12      u16    data arena offset from the region base
//! 14      u16    data arena size
//! 16      -      RING_CAPACITY descriptors of (offset: u16, len: u16)
//! ```
//!
//! Counters wrap naturally at 2^16. The distance `update - last_ack` is
//! always in `0..=2*RING_CAPACITY`; an odd value means a write or read
//! is in progress and the item must not be touched.

use crate::{REGION_PAGE, RING_CAPACITY, RING_MAGIC};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

/// One `(offset, len)` item descriptor in the circular array
#[repr(C)]
pub struct ItemDesc {
    pub offset: AtomicU16,
    pub len: AtomicU16,
}

impl ItemDesc {
    /// Publish both fields. Ordering is carried by the even-phase
    /// counter store, so relaxed is enough here.
    pub fn store(&self, offset: u16, len: u16) {
        self.offset.store(offset, Ordering::Relaxed);
        self.len.store(len, Ordering::Relaxed);
    }

    pub fn load(&self) -> (u16, u16) {
        (
            self.offset.load(Ordering::Relaxed),
            self.len.load(Ordering::Relaxed),
        )
    }
}

/// Ring header interpreted at the base of a mapped region
#[repr(C)]
pub struct RingHeader {
    pub magic: AtomicU32,
    pub ack: AtomicU16,
    pub last_ack: AtomicU16,
    pub update: AtomicU16,
    pub last_update: AtomicU16,
    pub data_offset: AtomicU16,
    pub data_size: AtomicU16,
    pub items: [ItemDesc; RING_CAPACITY],
}

// The header must fit the first region half, leaving the second for the arena.
const _: () = assert!(std::mem::size_of::<RingHeader>() <= REGION_PAGE);

impl RingHeader {
    /// Initialize a header over zeroed memory and publish the magic.
    /// Counters stay zero; the magic store is the creation barrier an
    /// attaching process synchronizes with.
    pub fn initialize(&self) {
        self.data_offset.store(REGION_PAGE as u16, Ordering::Relaxed);
        self.data_size.store(REGION_PAGE as u16, Ordering::Relaxed);
        self.magic.store(RING_MAGIC, Ordering::Release);
    }

    /// Check that the creating side has initialized this region
    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == RING_MAGIC
            && self.data_size.load(Ordering::Relaxed) as usize == REGION_PAGE
    }
}
