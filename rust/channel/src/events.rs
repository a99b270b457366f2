//! Signal-driven wakeups and the drain routine
//!
//! Peers nudge each other with `BUS_SIGNAL` after writing. The signal
//! is never handled in an async handler: each process blocks it and a
//! dedicated listener thread `sigwait`s, turning every delivery into a
//! [`BusEvent::Wake`] on an ordinary channel. The receiving side then
//! drains all live slots on its own thread, where taking locks and
//! allocating are fine.

use crate::registry::{Registry, SlotId};
use nix::sys::signal::{self, SigSet, Signal};
use nix::unistd::Pid;
use shmbus_core::{wire, BusError, PeerInfo, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Signal used to wake a peer after writing to its ring
pub const BUS_SIGNAL: Signal = Signal::SIGUSR1;

/// What a drain pass observed, delivered to the application
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The wake signal fired; a drain pass will follow
    Wake,
    /// A peer completed the connection handshake on this slot
    NewConnection { slot: SlotId, peer: PeerInfo },
    /// One drain pass moved this many items into the slot's backlog
    NewData { slot: SlotId, items: usize },
}

/// Send the wake signal to a peer process
pub fn notify(pid: i32) -> Result<()> {
    signal::kill(Pid::from_raw(pid), BUS_SIGNAL)
        .map_err(|e| BusError::Shm(format!("signalling pid {pid} failed: {e}")))
}

/// Dedicated thread that converts `BUS_SIGNAL` deliveries into wake
/// events. Spawning also blocks the signal on the calling thread, so
/// it must happen before any peer learns this process's pid.
pub struct SignalListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SignalListener {
    pub fn spawn(wake_tx: flume::Sender<BusEvent>) -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(BUS_SIGNAL);
        mask.thread_block()
            .map_err(|e| BusError::Shm(format!("blocking wake signal failed: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("shmbus-signal".into())
            .spawn(move || loop {
                match mask.wait() {
                    Ok(sig) if sig == BUS_SIGNAL => {
                        if flag.load(Ordering::Acquire) {
                            break;
                        }
                        if wake_tx.send(BusEvent::Wake).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    // EINTR; keep waiting
                    Err(_) => {}
                }
            })
            .map_err(BusError::Io)?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Wake the listener so it observes the stop flag
        let _ = signal::kill(Pid::this(), BUS_SIGNAL);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One drain pass over every live slot except the rendezvous slot.
///
/// Handshake items update the slot's peer and surface as
/// [`BusEvent::NewConnection`]; data items move into the slot's delay
/// buffer, coalesced into at most one [`BusEvent::NewData`] per slot.
/// Items that would overflow a backlog stay in their ring as
/// backpressure until the application pops the backlog.
pub fn drain_ready(registry: &mut Registry, scratch: &mut [u8]) -> Vec<BusEvent> {
    let mut events = Vec::new();

    for (slot, channel) in registry.iter_live() {
        if slot == 0 {
            continue;
        }
        let mut items = 0usize;

        loop {
            // Check backlog room before consuming, so a full backlog
            // leaves the item in the ring instead of dropping it.
            match channel.peek_incoming_len() {
                Ok(len) if !channel.delay().has_room_for(len) => {
                    warn!(slot, len, "backlog full, leaving items in ring");
                    break;
                }
                Ok(_) => {}
                Err(e) if e.is_empty_state() => break,
                Err(e) => {
                    warn!(slot, error = %e, "drain stopped");
                    break;
                }
            }

            let len = match channel.read_into(scratch) {
                Ok(len) => len,
                Err(e) if e.is_empty_state() => break,
                Err(e) => {
                    warn!(slot, error = %e, "drain stopped");
                    break;
                }
            };
            let item = &scratch[..len];

            if let Some((pid, name)) = wire::decode_handshake(item) {
                match PeerInfo::new(pid, name) {
                    Ok(peer) => {
                        debug!(slot, pid = peer.pid, name = %peer.name, "peer connected");
                        channel.set_peer(peer.clone());
                        events.push(BusEvent::NewConnection { slot, peer });
                    }
                    Err(e) => warn!(slot, error = %e, "rejected malformed handshake"),
                }
                continue;
            }

            if let Err(e) = channel.delay().append(item) {
                // Room was checked above; a failure here means the
                // backlog limit is smaller than one item.
                warn!(slot, error = %e, "item does not fit backlog");
                break;
            }
            channel.record_read(len);
            items += 1;
        }

        if items > 0 {
            events.push(BusEvent::NewData { slot, items });
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Channel, Role};
    use crate::SCRATCH_LEN;
    use shmbus_core::BusConfig;

    fn test_config(tag: &str) -> BusConfig {
        BusConfig {
            shm_prefix: format!("shmbus-test-ev-{}-{}", std::process::id(), tag),
            ..BusConfig::default()
        }
    }

    #[test]
    fn test_drain_handshake_then_data() {
        let config = test_config("drain");
        let mut registry = Registry::new();
        let slot = registry.open(2, Role::Owner, &config).unwrap();
        let mut client = Channel::open(2, Role::Client, &config).unwrap();

        client
            .write(wire::encode_handshake(4321, "client-a").as_bytes())
            .unwrap();
        client.write(b"payload-1").unwrap();
        client.write(b"payload-2").unwrap();

        let mut scratch = vec![0u8; SCRATCH_LEN];
        let events = drain_ready(&mut registry, &mut scratch);

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            BusEvent::NewConnection { slot: s, peer } if *s == slot && peer.pid == 4321
        ));
        assert!(matches!(
            &events[1],
            BusEvent::NewData { slot: s, items: 2 } if *s == slot
        ));

        let channel = registry.get_mut(slot).unwrap();
        assert!(channel.is_connected());
        // The handshake never reaches the backlog or the byte counter
        assert_eq!(channel.bytes_read(), 18);
        assert_eq!(
            channel.delay().read_bytes(1024).as_ref(),
            b"payload-1payload-2"
        );
    }

    #[test]
    fn test_drain_skips_rendezvous_slot() {
        let config = test_config("skip0");
        let mut registry = Registry::new();
        registry
            .open(crate::NAMESERVER_CHANNEL, Role::Owner, &config)
            .unwrap();
        let mut client =
            Channel::open(crate::NAMESERVER_CHANNEL, Role::Client, &config).unwrap();
        client.write(b"SERVICE svc 2 1234").unwrap();

        let mut scratch = vec![0u8; SCRATCH_LEN];
        assert!(drain_ready(&mut registry, &mut scratch).is_empty());

        // The request stays in the ring for the rendezvous path
        assert_eq!(
            registry.get_mut(0).unwrap().read_direct().unwrap(),
            b"SERVICE svc 2 1234"
        );
    }

    #[test]
    fn test_backlog_full_leaves_items_in_ring() {
        let config = BusConfig {
            delay_buffer_max: 40,
            ..test_config("backpressure")
        };
        let mut registry = Registry::new();
        let slot = registry.open(4, Role::Owner, &config).unwrap();
        let mut client = Channel::open(4, Role::Client, &config).unwrap();

        for _ in 0..4 {
            client.write(&[9u8; 16]).unwrap();
        }

        let mut scratch = vec![0u8; SCRATCH_LEN];
        let events = drain_ready(&mut registry, &mut scratch);
        assert!(matches!(
            events.as_slice(),
            [BusEvent::NewData { items: 2, .. }]
        ));

        // Consuming the backlog makes the next drain pick up the rest
        let channel = registry.get_mut(slot).unwrap();
        assert_eq!(channel.delay().read_bytes(32).len(), 32);
        let events = drain_ready(&mut registry, &mut scratch);
        assert!(matches!(
            events.as_slice(),
            [BusEvent::NewData { items: 2, .. }]
        ));
    }
}
