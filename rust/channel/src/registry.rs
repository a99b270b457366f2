//! Channel slots: duplex channels and the bounded per-process registry
//!
//! A logical channel number `n` names a pair of shared memory regions,
//! `n` and `n + READ_WRITE_OFFSET`, one ring per direction. The owning
//! side creates both regions and reads from `n`; the client side
//! attaches and reads from the complement, so either endpoint derives
//! the full pair from the channel number alone.

use crate::delay::DelayBuffer;
use crate::region::Region;
use crate::ring::{InsertError, ReadError, Ring};
use crate::{MAX_SLOTS, NAMESERVER_CHANNEL, READ_WRITE_OFFSET, REGION_SIZE};
use shmbus_core::{BusConfig, BusError, PeerInfo, Result};
use tracing::debug;

/// Index into the per-process slot table
pub type SlotId = usize;

/// Which end of a channel this process holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates both regions; reads from region `n`
    Owner,
    /// Attaches to existing regions; reads from region `n + offset`
    Client,
}

/// One duplex channel: a ring per direction plus the local backlog
#[derive(Debug)]
pub struct Channel {
    channel: u32,
    role: Role,
    owner: Option<String>,
    read_ring: Ring,
    write_ring: Ring,
    delay: DelayBuffer,
    peer: Option<PeerInfo>,
    bytes_read: u64,
    bytes_written: u64,
}

impl Channel {
    /// Open both directions of channel `channel` in the given role
    pub fn open(channel: u32, role: Role, config: &BusConfig) -> Result<Self> {
        let near = config.region_name(channel);
        let far = config.region_name(channel + READ_WRITE_OFFSET);

        let (read_ring, write_ring) = match role {
            Role::Owner => (
                Ring::create(Region::create(near, REGION_SIZE)?)?,
                Ring::create(Region::create(far, REGION_SIZE)?)?,
            ),
            Role::Client => (
                Ring::attach(Region::open(far, REGION_SIZE)?)?,
                Ring::attach(Region::open(near, REGION_SIZE)?)?,
            ),
        };
        debug!(channel, ?role, "opened channel");

        Ok(Self {
            channel,
            role,
            owner: None,
            read_ring,
            write_ring,
            delay: DelayBuffer::new(config.delay_buffer_initial, config.delay_buffer_max),
            peer: None,
            bytes_read: 0,
            bytes_written: 0,
        })
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Write one item to the outgoing ring
    pub fn write(&mut self, item: &[u8]) -> std::result::Result<(), InsertError> {
        self.write_ring.insert(item)?;
        self.bytes_written += item.len() as u64;
        Ok(())
    }

    /// Like [`Channel::write`] but outside the byte counters; the
    /// handshake and rendezvous traffic is plumbing, not payload.
    pub(crate) fn write_raw(&mut self, item: &[u8]) -> std::result::Result<(), InsertError> {
        self.write_ring.insert(item)
    }

    /// Read one item straight off the incoming ring, bypassing the
    /// delay buffer. Only the rendezvous path uses this; the normal
    /// data path goes through the drain.
    pub fn read_direct(&mut self) -> std::result::Result<Vec<u8>, ReadError> {
        self.read_ring.read()
    }

    /// Allocation-free incoming read for the drain path. The byte
    /// counter is advanced by the drain only for payload items, so
    /// handshakes never show up in it.
    pub fn read_into(&mut self, scratch: &mut [u8]) -> std::result::Result<usize, ReadError> {
        self.read_ring.read_into(scratch)
    }

    pub(crate) fn record_read(&mut self, len: usize) {
        self.bytes_read += len as u64;
    }

    /// Length of the next incoming item without consuming it
    pub fn peek_incoming_len(&self) -> std::result::Result<usize, ReadError> {
        self.read_ring.peek_len()
    }

    pub fn delay(&mut self) -> &mut DelayBuffer {
        &mut self.delay
    }

    pub fn bytes_available(&self) -> usize {
        self.delay.bytes_available()
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.owner = Some(owner.into());
    }

    pub fn pending_outgoing(&self) -> usize {
        self.write_ring.pending_items()
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    pub fn set_peer(&mut self, peer: PeerInfo) {
        self.peer = Some(peer);
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// Bounded per-process table of open channels. Slot 0 is reserved for
/// the nameserver rendezvous channel.
pub struct Registry {
    slots: [Option<Channel>; MAX_SLOTS],
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Open a channel and claim a slot for it. The nameserver channel
    /// always takes slot 0; everything else takes the lowest free slot.
    pub fn open(&mut self, channel: u32, role: Role, config: &BusConfig) -> Result<SlotId> {
        let slot = self.claim_slot(channel)?;
        self.slots[slot] = Some(Channel::open(channel, role, config)?);
        Ok(slot)
    }

    fn claim_slot(&self, channel: u32) -> Result<SlotId> {
        if channel == NAMESERVER_CHANNEL {
            return if self.slots[0].is_none() {
                Ok(0)
            } else {
                Err(BusError::Protocol(
                    "nameserver channel is already open".into(),
                ))
            };
        }
        if self.slot_for_channel(channel).is_some() {
            return Err(BusError::Protocol(format!(
                "channel {channel} is already open"
            )));
        }
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .ok_or(BusError::SlotsExhausted {
                capacity: MAX_SLOTS,
            })
    }

    /// Close a slot, unmapping both rings (and unlinking the regions if
    /// this side created them)
    pub fn close(&mut self, slot: SlotId) -> Result<()> {
        self.check_slot(slot)?;
        match self.slots[slot].take() {
            Some(channel) => {
                debug!(slot, channel = channel.channel(), "closed channel");
                Ok(())
            }
            None => Err(BusError::InvalidSlot(slot)),
        }
    }

    pub fn get(&self, slot: SlotId) -> Result<&Channel> {
        self.check_slot(slot)?;
        self.slots[slot]
            .as_ref()
            .ok_or(BusError::InvalidSlot(slot))
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Result<&mut Channel> {
        self.check_slot(slot)?;
        self.slots[slot]
            .as_mut()
            .ok_or(BusError::InvalidSlot(slot))
    }

    fn check_slot(&self, slot: SlotId) -> Result<()> {
        if slot >= MAX_SLOTS {
            return Err(BusError::InvalidSlot(slot));
        }
        Ok(())
    }

    /// Route a channel number back to its slot
    pub fn slot_for_channel(&self, channel: u32) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|c| c.channel() == channel))
    }

    /// Route a peer name to the slot connected to that peer
    pub fn route(&self, peer_name: &str) -> Option<SlotId> {
        self.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|c| c.peer().is_some_and(|p| p.name == peer_name))
        })
    }

    /// Tag a slot with the local endpoint name it belongs to
    pub fn set_owner(&mut self, slot: SlotId, owner: &str) -> Result<()> {
        self.get_mut(slot)?.set_owner(owner);
        Ok(())
    }

    /// All open slots in slot order
    pub fn iter_live(&mut self) -> impl Iterator<Item = (SlotId, &mut Channel)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|c| (i, c)))
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(tag: &str) -> BusConfig {
        BusConfig {
            shm_prefix: format!("shmbus-test-reg-{}-{}", std::process::id(), tag),
            ..BusConfig::default()
        }
    }

    #[test]
    fn test_owner_client_duplex() {
        let config = test_config("duplex");
        let mut owner = Channel::open(3, Role::Owner, &config).unwrap();
        let mut client = Channel::open(3, Role::Client, &config).unwrap();

        owner.write(b"from owner").unwrap();
        client.write(b"from client").unwrap();

        assert_eq!(client.read_direct().unwrap(), b"from owner");
        assert_eq!(owner.read_direct().unwrap(), b"from client");
        assert_eq!(owner.bytes_written(), 10);
        assert_eq!(client.bytes_written(), 11);
    }

    #[test]
    fn test_route_by_peer_name() {
        let config = test_config("route");
        let mut registry = Registry::new();
        let slot = registry.open(2, Role::Owner, &config).unwrap();
        assert_eq!(registry.route("alice"), None);

        registry
            .get_mut(slot)
            .unwrap()
            .set_peer(PeerInfo::new(42, "alice").unwrap());
        assert_eq!(registry.route("alice"), Some(slot));

        registry.set_owner(slot, "svc").unwrap();
        assert_eq!(registry.get(slot).unwrap().owner(), Some("svc"));
    }

    #[test]
    fn test_client_needs_existing_regions() {
        let config = test_config("orphan");
        let err = Channel::open(9, Role::Client, &config).unwrap_err();
        assert!(matches!(err, BusError::RegionNotFound(_)));
    }

    #[test]
    fn test_slot_zero_reserved_for_nameserver() {
        let config = test_config("slots");
        let mut registry = Registry::new();

        let data_slot = registry.open(1, Role::Owner, &config).unwrap();
        assert_eq!(data_slot, 1);

        let ns_slot = registry
            .open(NAMESERVER_CHANNEL, Role::Owner, &config)
            .unwrap();
        assert_eq!(ns_slot, 0);
    }

    #[test]
    fn test_slots_exhausted() {
        let config = test_config("exhaust");
        let mut registry = Registry::new();
        for channel in 1..MAX_SLOTS as u32 {
            registry.open(channel, Role::Owner, &config).unwrap();
        }
        let err = registry.open(99, Role::Owner, &config).unwrap_err();
        assert!(matches!(
            err,
            BusError::SlotsExhausted {
                capacity: MAX_SLOTS
            }
        ));
    }

    #[test]
    fn test_close_frees_slot_and_routing() {
        let config = test_config("close");
        let mut registry = Registry::new();
        let slot = registry.open(5, Role::Owner, &config).unwrap();
        assert_eq!(registry.slot_for_channel(5), Some(slot));

        registry.close(slot).unwrap();
        assert_eq!(registry.slot_for_channel(5), None);
        assert!(matches!(
            registry.close(slot).unwrap_err(),
            BusError::InvalidSlot(_)
        ));

        // Slot and channel number are both reusable after close
        assert_eq!(registry.open(5, Role::Owner, &config).unwrap(), slot);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let config = test_config("dup");
        let mut registry = Registry::new();
        registry.open(7, Role::Owner, &config).unwrap();
        assert!(matches!(
            registry.open(7, Role::Owner, &config).unwrap_err(),
            BusError::Protocol(_)
        ));
    }
}
