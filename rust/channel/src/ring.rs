//! Wait-free SPSC item exchange over one shared memory region
//!
//! Each ring has exactly one producer process and one consumer process.
//! All synchronization is carried by the `update` and `ack` counters:
//! each is written by exactly one side and advanced in two steps, `+1`
//! (odd phase, operation in progress) then `+1` again (even phase,
//! operation complete). A side observing the other's odd phase defers
//! instead of touching a torn item, which makes the exchange wait-free
//! and safe to run from the drain path without locks.

use crate::layout::RingHeader;
use crate::region::Region;
use crate::{REGION_PAGE, RING_CAPACITY};
use shmbus_core::{BusError, Result};
use std::sync::atomic::Ordering;
use thiserror::Error;

/// Producer-side outcome of a failed insert
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// All descriptor slots hold unacknowledged items, or the data
    /// arena is too fragmented to place the payload
    #[error("ring full")]
    Full,

    /// The last free slot is mid-read by the consumer; transient
    #[error("ring full, consumer mid-read on the last slot")]
    ConsumerReading,

    /// The payload can never fit this ring's data arena
    #[error("item of {len} bytes exceeds arena size {max}")]
    TooLarge { len: usize, max: usize },
}

impl InsertError {
    /// Transient states resolve on their own; retry after a short wait
    pub fn is_transient(&self) -> bool {
        matches!(self, InsertError::ConsumerReading)
    }
}

/// Consumer-side outcome of a failed read
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// No item is ready
    #[error("ring empty")]
    Empty,

    /// The producer is between its two counter steps; transient
    #[error("ring empty, producer mid-insert")]
    ProducerInserting,

    /// Contract violation on the allocation-free path: the caller's
    /// scratch buffer is smaller than the next item. The item stays in
    /// the ring.
    #[error("item of {len} bytes exceeds scratch capacity {capacity}")]
    ScratchTooSmall { len: usize, capacity: usize },
}

impl ReadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ReadError::ProducerInserting)
    }

    /// Both empty states mean "nothing consumable right now"
    pub fn is_empty_state(&self) -> bool {
        matches!(self, ReadError::Empty | ReadError::ProducerInserting)
    }
}

/// One direction of a channel: a ring header plus data arena mapped
/// from a shared memory region
#[derive(Debug)]
pub struct Ring {
    region: Region,
}

impl Ring {
    /// Take ownership of a freshly created (zeroed) region and
    /// initialize its header
    pub fn create(region: Region) -> Result<Self> {
        check_region_len(&region)?;
        let ring = Self { region };
        ring.header().initialize();
        Ok(ring)
    }

    /// Wrap a region created by a peer, validating its header
    pub fn attach(region: Region) -> Result<Self> {
        check_region_len(&region)?;
        let ring = Self { region };
        if !ring.header().is_initialized() {
            return Err(BusError::Shm(format!(
                "region {} is not an initialized ring",
                ring.region.name()
            )));
        }
        Ok(ring)
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub(crate) fn header(&self) -> &RingHeader {
        // Safety: the region is at least REGION_SIZE bytes and outlives
        // self; the header layout is validated at attach time.
        unsafe { &*(self.region.as_ptr() as *const RingHeader) }
    }

    fn arena(&self) -> *mut u8 {
        // Safety: the arena occupies the second region half.
        unsafe { self.region.as_ptr().add(REGION_PAGE) }
    }

    /// Items inserted but not yet acknowledged by the consumer
    pub fn pending_items(&self) -> usize {
        let h = self.header();
        let update = h.update.load(Ordering::Acquire);
        let last_ack = h.last_ack.load(Ordering::Relaxed);
        update.wrapping_sub(last_ack) as usize / 2
    }

    /// Insert one item, the producer side of the exchange
    pub fn insert(&self, item: &[u8]) -> std::result::Result<(), InsertError> {
        let h = self.header();
        let data_size = h.data_size.load(Ordering::Relaxed) as usize;
        if item.len() > data_size {
            return Err(InsertError::TooLarge {
                len: item.len(),
                max: data_size,
            });
        }

        let last_update = h.last_update.load(Ordering::Relaxed);
        let ack = h.ack.load(Ordering::Acquire);
        let outstanding = last_update.wrapping_sub(ack) as usize;
        if outstanding == 2 * RING_CAPACITY {
            return Err(InsertError::Full);
        }
        if outstanding == 2 * RING_CAPACITY - 1 {
            return Err(InsertError::ConsumerReading);
        }

        let offset = self.place(last_update, ack, outstanding, item.len(), data_size)?;

        // Odd phase: a reader interrupting from here on sees
        // "insert in progress" and defers.
        h.update.store(last_update.wrapping_add(1), Ordering::Release);

        unsafe {
            std::ptr::copy_nonoverlapping(
                item.as_ptr(),
                self.arena().add(offset as usize),
                item.len(),
            );
        }
        h.items[(last_update / 2) as usize % RING_CAPACITY].store(offset, item.len() as u16);

        // Even phase publishes the payload and descriptor.
        h.update.store(last_update.wrapping_add(2), Ordering::Release);
        h.last_update
            .store(last_update.wrapping_add(2), Ordering::Relaxed);
        Ok(())
    }

    /// Pick a placement offset in the data arena: append after the
    /// previous item, else wrap to offset 0 if the oldest
    /// unacknowledged item leaves room, else the arena is too
    /// fragmented even though the counter check passed.
    fn place(
        &self,
        last_update: u16,
        ack: u16,
        outstanding: usize,
        len: usize,
        data_size: usize,
    ) -> std::result::Result<u16, InsertError> {
        if outstanding == 0 {
            // Everything is acknowledged; the whole arena is free.
            return Ok(0);
        }
        let h = self.header();
        let prev = &h.items[((last_update / 2).wrapping_sub(1)) as usize % RING_CAPACITY];
        let (prev_off, prev_len) = prev.load();
        let end = prev_off as usize + prev_len as usize;
        let (oldest_off, _) = h.items[(ack / 2) as usize % RING_CAPACITY].load();
        let oldest = oldest_off as usize;

        if oldest < end {
            // Unwrapped tail: append up to the arena end, or start a
            // new lap at offset 0 if the gap below the oldest item
            // takes the payload.
            if end + len <= data_size {
                Ok(end as u16)
            } else if len <= oldest {
                Ok(0)
            } else {
                Err(InsertError::Full)
            }
        } else {
            // The tail already wrapped below the oldest item; the only
            // free space is the gap [end, oldest). Falling back to
            // offset 0 here would overwrite unacknowledged bytes.
            if end + len <= oldest {
                Ok(end as u16)
            } else {
                Err(InsertError::Full)
            }
        }
    }

    /// Locate the next ready item without consuming it
    fn ready_item(&self) -> std::result::Result<(u16, u16, u16), ReadError> {
        let h = self.header();
        let last_ack = h.last_ack.load(Ordering::Relaxed);
        let update = h.update.load(Ordering::Acquire);
        let pending = update.wrapping_sub(last_ack);
        if pending == 0 {
            return Err(ReadError::Empty);
        }
        if pending == 1 {
            return Err(ReadError::ProducerInserting);
        }
        let (offset, len) = h.items[(last_ack / 2) as usize % RING_CAPACITY].load();
        Ok((last_ack, offset, len))
    }

    /// Size of the next ready item, if any
    pub fn peek_len(&self) -> std::result::Result<usize, ReadError> {
        self.ready_item().map(|(_, _, len)| len as usize)
    }

    fn consume(&self, last_ack: u16, offset: u16, len: u16, dst: *mut u8) {
        let h = self.header();
        h.ack.store(last_ack.wrapping_add(1), Ordering::Release);
        unsafe {
            std::ptr::copy_nonoverlapping(self.arena().add(offset as usize), dst, len as usize);
        }
        h.ack.store(last_ack.wrapping_add(2), Ordering::Release);
        h.last_ack
            .store(last_ack.wrapping_add(2), Ordering::Relaxed);
    }

    /// Read the next item into a fresh buffer
    pub fn read(&self) -> std::result::Result<Vec<u8>, ReadError> {
        let (last_ack, offset, len) = self.ready_item()?;
        let mut out = vec![0u8; len as usize];
        self.consume(last_ack, offset, len, out.as_mut_ptr());
        Ok(out)
    }

    /// Allocation-free read for the drain path: the caller supplies the
    /// scratch storage and gets the item length back
    pub fn read_into(&self, scratch: &mut [u8]) -> std::result::Result<usize, ReadError> {
        let (last_ack, offset, len) = self.ready_item()?;
        if len as usize > scratch.len() {
            return Err(ReadError::ScratchTooSmall {
                len: len as usize,
                capacity: scratch.len(),
            });
        }
        self.consume(last_ack, offset, len, scratch.as_mut_ptr());
        Ok(len as usize)
    }
}

fn check_region_len(region: &Region) -> Result<()> {
    if region.len() < crate::REGION_SIZE {
        return Err(BusError::Shm(format!(
            "region {} is {} bytes, need {}",
            region.name(),
            region.len(),
            crate::REGION_SIZE
        )));
    }
    Ok(())
}
