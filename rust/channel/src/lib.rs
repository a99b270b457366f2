//! shmbus - Shared Memory Channel Module
//!
//! Wait-free SPSC ring buffers over POSIX shared memory, the bounded
//! channel/slot registry, the nameserver rendezvous protocol and the
//! signal-driven event delivery path.

pub mod bus;
pub mod delay;
pub mod events;
pub mod layout;
pub mod nameserver;
pub mod region;
pub mod registry;
pub mod rendezvous;
pub mod ring;

pub use bus::{Bus, ChannelStats};
pub use delay::DelayBuffer;
pub use events::{BusEvent, BUS_SIGNAL};
pub use nameserver::Nameserver;
pub use region::Region;
pub use registry::{Channel, Registry, Role, SlotId};
pub use ring::{InsertError, ReadError, Ring};

/// Maximum number of channel slots per process. Slot 0 is permanently
/// reserved for the nameserver rendezvous channel.
pub const MAX_SLOTS: usize = 16;

/// Item descriptors per ring direction. `2 * RING_CAPACITY` must stay
/// well inside the u16 counter range so a full cycle is unambiguous.
pub const RING_CAPACITY: usize = 1024;

/// Bytes per region half: half one holds the ring header, half two the
/// data arena addressed by 16-bit offsets.
pub const REGION_PAGE: usize = 16 * 1024;

/// Total size of one shared memory region (one ring direction)
pub const REGION_SIZE: usize = 2 * REGION_PAGE;

/// Numeric offset between the read id and write id of one logical
/// channel; either endpoint derives its peer's complementary id from
/// the channel number alone.
pub const READ_WRITE_OFFSET: u32 = 1000;

/// Well-known channel number of the nameserver rendezvous pair
pub const NAMESERVER_CHANNEL: u32 = 0;

/// Channel numbers the nameserver may hand out (1..=CHANNEL_ID_POOL)
pub const CHANNEL_ID_POOL: u32 = 64;

/// Fixed scratch capacity for the allocation-free drain read
pub const SCRATCH_LEN: usize = 16 * 1024;

/// Magic marking an initialized ring header ("SBUS")
pub const RING_MAGIC: u32 = 0x5342_5553;

const _: () = assert!(2 * RING_CAPACITY < u16::MAX as usize);
const _: () = assert!(REGION_PAGE <= u16::MAX as usize);
const _: () = assert!(NAMESERVER_CHANNEL < READ_WRITE_OFFSET);
const _: () = assert!(CHANNEL_ID_POOL < READ_WRITE_OFFSET);
