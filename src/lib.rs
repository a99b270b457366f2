//! shmbus — wait-free shared-memory message bus for local IPC
//!
//! Processes exchange byte items over single-producer single-consumer
//! ring buffers in POSIX shared memory, rendezvous through a per-bus
//! nameserver, and wake each other with `SIGUSR1`. This facade crate
//! re-exports the public surface of the workspace.
//!
//! A minimal service:
//!
//! ```no_run
//! use shmbus::{Bus, BusConfig};
//!
//! fn main() -> shmbus::Result<()> {
//!     let bus = Bus::new(BusConfig::default())?;
//!     let slots = bus.init_service("echo", 1)?;
//!     loop {
//!         bus.drain_now();
//!         let data = bus.read_bytes(slots[0], 4096)?;
//!         if !data.is_empty() {
//!             bus.write_bytes(slots[0], &data)?;
//!         }
//!     }
//! }
//! ```

pub use shmbus_core::{
    wire, BusConfig, BusError, CancelToken, Deadline, PeerInfo, Result, MAX_NAME_LEN, VERSION,
};

pub use shmbus_channel::{
    Bus, BusEvent, Channel, ChannelStats, DelayBuffer, InsertError, Nameserver, ReadError, Region,
    Registry, Ring, Role, SlotId, BUS_SIGNAL, CHANNEL_ID_POOL, MAX_SLOTS, NAMESERVER_CHANNEL,
    READ_WRITE_OFFSET, REGION_PAGE, REGION_SIZE, RING_CAPACITY, SCRATCH_LEN,
};
