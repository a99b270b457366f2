//! The `Bus`: public endpoint API over the registry and event path
//!
//! One `Bus` per process is the usual shape. It owns the process-local
//! registry, talks to the nameserver on behalf of services and clients,
//! and runs the signal listener plus a dispatch thread that turns every
//! wake into a drain pass. Applications consume incoming data through
//! the per-slot backlog, the event queue, or owner-scoped callbacks;
//! hosts without a signal path drive everything through
//! [`Bus::handle_events`].

use crate::events::{self, BusEvent, SignalListener};
use crate::registry::{Registry, Role, SlotId};
use crate::rendezvous;
use crate::ring::InsertError;
use crate::{NAMESERVER_CHANNEL, SCRATCH_LEN};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use shmbus_core::wire::{self, Reply, Request};
use shmbus_core::{BusConfig, BusError, CancelToken, Deadline, PeerInfo, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bound on the application-facing event queue; a reader that falls
/// this far behind loses oldest-first notifications, never data
const EVENT_QUEUE_DEPTH: usize = 256;

/// How often the dispatch thread rechecks for shutdown while idle
const DISPATCH_IDLE: Duration = Duration::from_millis(100);

type ConnectCallback = Box<dyn FnMut(SlotId, &PeerInfo) + Send>;
type DataCallback = Box<dyn FnMut(SlotId, usize) + Send>;
type PollHook = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct OwnerCallbacks {
    on_connect: Option<ConnectCallback>,
    on_data: Option<DataCallback>,
}

/// Flow counters and connection state of one slot
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub channel: u32,
    pub owner: Option<String>,
    pub connected: bool,
    pub peer: Option<PeerInfo>,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_available: usize,
    pub pending_outgoing: usize,
}

struct Shared {
    config: BusConfig,
    registry: Mutex<Registry>,
    callbacks: Mutex<HashMap<String, OwnerCallbacks>>,
    poll_hook: Mutex<Option<PollHook>>,
    scratch: Mutex<Vec<u8>>,
    events_tx: flume::Sender<BusEvent>,
}

impl Shared {
    /// One drain pass followed by callback dispatch. Callbacks run
    /// after the registry lock is released, so they may call back into
    /// the bus freely.
    fn drain_and_dispatch(&self) -> usize {
        let tagged: Vec<(BusEvent, Option<String>)> = {
            let mut registry = self.registry.lock();
            let mut scratch = self.scratch.lock();
            let drained = events::drain_ready(&mut registry, &mut scratch);
            drained
                .into_iter()
                .map(|event| {
                    let owner = match &event {
                        BusEvent::NewConnection { slot, .. }
                        | BusEvent::NewData { slot, .. } => registry
                            .get(*slot)
                            .ok()
                            .and_then(|c| c.owner().map(str::to_string)),
                        BusEvent::Wake => None,
                    };
                    (event, owner)
                })
                .collect()
        };

        let count = tagged.len();
        for (event, owner) in tagged {
            // Take the owner's callbacks out of the map for the call,
            // so a callback can register callbacks itself without
            // deadlocking on the map lock.
            if let Some(owner) = owner {
                // Bind the removal first so the map guard drops before
                // the callbacks run; the scrutinee temporary would
                // otherwise live for the whole block on edition 2021.
                let cbs = self.callbacks.lock().remove(&owner);
                if let Some(mut cbs) = cbs {
                    match &event {
                        BusEvent::NewConnection { slot, peer } => {
                            if let Some(cb) = &mut cbs.on_connect {
                                cb(*slot, peer);
                            }
                        }
                        BusEvent::NewData { slot, items } => {
                            if let Some(cb) = &mut cbs.on_data {
                                cb(*slot, *items);
                            }
                        }
                        BusEvent::Wake => {}
                    }
                    // Put them back; anything registered during the
                    // call wins over what was taken out.
                    let mut map = self.callbacks.lock();
                    let entry = map.entry(owner).or_default();
                    if entry.on_connect.is_none() {
                        entry.on_connect = cbs.on_connect;
                    }
                    if entry.on_data.is_none() {
                        entry.on_data = cbs.on_data;
                    }
                }
            }
            if self.events_tx.try_send(event).is_err() {
                debug!("event queue full, notification dropped");
            }
        }
        count
    }
}

/// A process's handle on the shared-memory bus
pub struct Bus {
    shared: Arc<Shared>,
    events_rx: flume::Receiver<BusEvent>,
    cancel: CancelToken,
    listener: Option<SignalListener>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Bus {
    /// Stand up the endpoint: with signal delivery enabled this blocks
    /// the wake signal and starts the listener and dispatch threads
    /// before anything can be connected.
    pub fn new(config: BusConfig) -> Result<Self> {
        let (events_tx, events_rx) = flume::bounded(EVENT_QUEUE_DEPTH);
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::new()),
            callbacks: Mutex::new(HashMap::new()),
            poll_hook: Mutex::new(None),
            scratch: Mutex::new(vec![0u8; SCRATCH_LEN]),
            events_tx,
            config,
        });
        let cancel = CancelToken::new();

        let (listener, dispatcher) = if shared.config.deliver_signals {
            let (wake_tx, wake_rx) = flume::unbounded();
            let listener = SignalListener::spawn(wake_tx)?;
            let worker = Arc::clone(&shared);
            let stop = cancel.clone();
            let handle = thread::Builder::new()
                .name("shmbus-dispatch".into())
                .spawn(move || {
                    while !stop.is_cancelled() {
                        match wake_rx.recv_timeout(DISPATCH_IDLE) {
                            Ok(BusEvent::Wake) => {
                                let _ = worker.events_tx.try_send(BusEvent::Wake);
                                worker.drain_and_dispatch();
                            }
                            Ok(_) => {}
                            Err(flume::RecvTimeoutError::Timeout) => {}
                            Err(flume::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
                .map_err(BusError::Io)?;
            (Some(listener), Some(handle))
        } else {
            (None, None)
        };

        Ok(Self {
            shared,
            events_rx,
            cancel,
            listener,
            dispatcher,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Token cancelling every bounded wait on this bus
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn rendezvous(&self, request: &Request) -> Result<Reply> {
        let server_pid = rendezvous::read_server_pid(&self.shared.config)?;
        let mut registry = self.shared.registry.lock();
        if registry.slot_for_channel(NAMESERVER_CHANNEL).is_none() {
            registry.open(NAMESERVER_CHANNEL, Role::Client, &self.shared.config)?;
        }
        let channel = registry.get_mut(0)?;
        rendezvous::exchange(
            channel,
            request,
            server_pid,
            &self.shared.config,
            &self.cancel,
        )
    }

    /// Register a service and open its reserved channels, one slot per
    /// channel, all owned by `name`
    pub fn init_service(&self, name: &str, channel_count: u32) -> Result<Vec<SlotId>> {
        let pid = std::process::id() as i32;
        let identity = PeerInfo::new(pid, name)?;
        let reply = self.rendezvous(&Request::Register {
            name: identity.name.clone(),
            channels: channel_count,
            pid,
        })?;
        match reply {
            Reply::Channels(ids) => {
                let mut registry = self.shared.registry.lock();
                let mut slots = Vec::with_capacity(ids.len());
                for id in &ids {
                    let slot = registry.open(*id, Role::Owner, &self.shared.config)?;
                    registry.set_owner(slot, name)?;
                    slots.push(slot);
                }
                info!(service = name, ?ids, "service registered");
                Ok(slots)
            }
            Reply::ChannelsExhausted => Err(BusError::ChannelPoolExhausted),
            other => Err(BusError::Protocol(format!(
                "unexpected registration reply {other:?}"
            ))),
        }
    }

    /// Resolve a service, attach its next free channel and announce
    /// ourselves on it with the handshake
    pub fn connect_client(&self, client_name: &str, service_name: &str) -> Result<SlotId> {
        let pid = std::process::id() as i32;
        let identity = PeerInfo::new(pid, client_name)?;
        let reply = self.rendezvous(&Request::Lookup {
            service: service_name.to_string(),
        })?;
        let (channel, service_pid) = match reply {
            Reply::Endpoint { channel, pid } => (channel, pid),
            Reply::UnknownService => {
                return Err(BusError::UnknownService(service_name.to_string()))
            }
            Reply::ServiceBusy => return Err(BusError::ServiceBusy(service_name.to_string())),
            other => {
                return Err(BusError::Protocol(format!(
                    "unexpected lookup reply {other:?}"
                )))
            }
        };

        let slot = {
            let mut registry = self.shared.registry.lock();
            let slot = registry.open(channel, Role::Client, &self.shared.config)?;
            registry.set_owner(slot, client_name)?;
            registry
                .get_mut(slot)?
                .set_peer(PeerInfo::new(service_pid, service_name)?);
            slot
        };

        let handshake = wire::encode_handshake(pid, &identity.name);
        let deadline = Deadline::after(self.shared.config.send_timeout);
        loop {
            // Reacquire per attempt so a retry never stalls the
            // dispatch thread for the whole wait.
            let mut registry = self.shared.registry.lock();
            match registry.get_mut(slot)?.write_raw(handshake.as_bytes()) {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    drop(registry);
                    self.wait_step(&deadline)?;
                }
                Err(e) => {
                    return Err(BusError::Protocol(format!(
                        "handshake write on fresh channel {channel} failed: {e}"
                    )))
                }
            }
        }

        if self.shared.config.deliver_signals {
            events::notify(service_pid)?;
        }
        info!(client = client_name, service = service_name, channel, slot, "connected");
        Ok(slot)
    }

    /// Write one payload item to a slot and wake the peer
    pub fn write_bytes(&self, slot: SlotId, bytes: &[u8]) -> Result<()> {
        let deadline = Deadline::after(self.shared.config.send_timeout);
        let peer_pid = loop {
            let mut registry = self.shared.registry.lock();
            let channel = registry.get_mut(slot)?;
            let Some(peer) = channel.peer() else {
                return Err(BusError::NotConnected(format!(
                    "slot {slot} has no connected peer"
                )));
            };
            let pid = peer.pid;
            match channel.write(bytes) {
                Ok(()) => break pid,
                Err(InsertError::TooLarge { len, max }) => {
                    return Err(BusError::PayloadTooLarge { len, max })
                }
                // Full or consumer mid-read; both resolve as the peer
                // drains, so retry until the send deadline.
                Err(e) => {
                    debug!(slot, error = %e, "ring busy, retrying");
                    drop(registry);
                    self.wait_step(&deadline)?;
                }
            }
        };
        if self.shared.config.deliver_signals {
            events::notify(peer_pid)?;
        }
        Ok(())
    }

    /// Write to whichever slot is connected to the named peer
    pub fn send(&self, destination: &str, bytes: &[u8]) -> Result<()> {
        let slot = self
            .shared
            .registry
            .lock()
            .route(destination)
            .ok_or_else(|| {
                BusError::NotConnected(format!("no channel connected to {destination:?}"))
            })?;
        self.write_bytes(slot, bytes)
    }

    /// Take up to `max` backlog bytes from a slot
    pub fn read_bytes(&self, slot: SlotId, max: usize) -> Result<Bytes> {
        let mut registry = self.shared.registry.lock();
        Ok(registry.get_mut(slot)?.delay().read_bytes(max))
    }

    pub fn bytes_available(&self, slot: SlotId) -> Result<usize> {
        Ok(self.shared.registry.lock().get(slot)?.bytes_available())
    }

    pub fn bytes_read(&self, slot: SlotId) -> Result<u64> {
        Ok(self.shared.registry.lock().get(slot)?.bytes_read())
    }

    pub fn bytes_written(&self, slot: SlotId) -> Result<u64> {
        Ok(self.shared.registry.lock().get(slot)?.bytes_written())
    }

    /// Re-tag a slot; its events go to the new owner's callbacks
    pub fn set_owner(&self, slot: SlotId, owner: &str) -> Result<()> {
        self.shared.registry.lock().set_owner(slot, owner)
    }

    /// Fires once per peer handshake on any slot owned by `owner`
    pub fn register_new_connection_callback(
        &self,
        owner: &str,
        callback: impl FnMut(SlotId, &PeerInfo) + Send + 'static,
    ) {
        self.shared
            .callbacks
            .lock()
            .entry(owner.to_string())
            .or_default()
            .on_connect = Some(Box::new(callback));
    }

    /// Fires once per drain pass that moved data into an owned slot
    pub fn register_new_data_callback(
        &self,
        owner: &str,
        callback: impl FnMut(SlotId, usize) + Send + 'static,
    ) {
        self.shared
            .callbacks
            .lock()
            .entry(owner.to_string())
            .or_default()
            .on_data = Some(Box::new(callback));
    }

    /// Host hook invoked at the top of every [`Bus::handle_events`]
    pub fn register_poll_hook(&self, hook: impl FnMut() + Send + 'static) {
        *self.shared.poll_hook.lock() = Some(Box::new(hook));
    }

    /// Poll-mode entry point: run the poll hook, then one drain pass.
    /// Returns the number of events produced.
    pub fn handle_events(&self) -> usize {
        if let Some(hook) = self.shared.poll_hook.lock().as_mut() {
            hook();
        }
        self.shared.drain_and_dispatch()
    }

    /// One synchronous drain pass, independent of the signal path
    pub fn drain_now(&self) -> usize {
        self.shared.drain_and_dispatch()
    }

    /// Receiver of drained event notifications
    pub fn events(&self) -> flume::Receiver<BusEvent> {
        self.events_rx.clone()
    }

    pub fn channel_stats(&self, slot: SlotId) -> Result<ChannelStats> {
        let registry = self.shared.registry.lock();
        let channel = registry.get(slot)?;
        Ok(ChannelStats {
            channel: channel.channel(),
            owner: channel.owner().map(str::to_string),
            connected: channel.is_connected(),
            peer: channel.peer().cloned(),
            bytes_read: channel.bytes_read(),
            bytes_written: channel.bytes_written(),
            bytes_available: channel.bytes_available(),
            pending_outgoing: channel.pending_outgoing(),
        })
    }

    /// Tear one slot down; creator-side regions are unlinked but stay
    /// mapped in the peer until it closes too
    pub fn close_channel(&self, slot: SlotId) -> Result<()> {
        self.shared.registry.lock().close(slot)
    }

    fn wait_step(&self, deadline: &Deadline) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        if deadline.expired() {
            return Err(BusError::Timeout {
                timeout_ms: deadline.budget_ms(),
            });
        }
        thread::sleep(self.shared.config.poll_interval);
        Ok(())
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Dropping the listener disconnects the wake channel, which
        // ends the dispatch loop.
        self.listener.take();
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                warn!("dispatch thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Channel;

    fn test_bus(tag: &str) -> Bus {
        let dir = tempfile::tempdir().unwrap();
        let config = BusConfig {
            shm_prefix: format!("shmbus-test-bus-{}-{}", std::process::id(), tag),
            runtime_dir: dir.keep(),
            deliver_signals: false,
            ..BusConfig::default()
        };
        Bus::new(config).unwrap()
    }

    /// Open a channel on the bus directly, with a peer endpoint,
    /// bypassing the nameserver
    fn wire_up(bus: &Bus, channel: u32, owner: &str) -> (SlotId, Channel) {
        let slot = {
            let mut registry = bus.shared.registry.lock();
            let slot = registry.open(channel, Role::Owner, &bus.shared.config).unwrap();
            registry.set_owner(slot, owner).unwrap();
            slot
        };
        let peer = Channel::open(channel, Role::Client, &bus.shared.config).unwrap();
        (slot, peer)
    }

    #[test]
    fn test_write_requires_peer() {
        let bus = test_bus("nopeer");
        let (slot, _peer) = wire_up(&bus, 1, "svc");
        assert!(matches!(
            bus.write_bytes(slot, b"hello").unwrap_err(),
            BusError::NotConnected(_)
        ));
        assert!(matches!(
            bus.send("nobody", b"hello").unwrap_err(),
            BusError::NotConnected(_)
        ));
    }

    #[test]
    fn test_handshake_then_data_flow() {
        let bus = test_bus("flow");
        let (slot, mut peer) = wire_up(&bus, 1, "svc");

        peer.write(wire::encode_handshake(777, "cli").as_bytes())
            .unwrap();
        peer.write(b"ping").unwrap();
        assert_eq!(bus.drain_now(), 2);

        // Handshake produced the connection before any data event
        let events = bus.events();
        assert!(matches!(
            events.try_recv().unwrap(),
            BusEvent::NewConnection { peer, .. } if peer.pid == 777
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            BusEvent::NewData { items: 1, .. }
        ));

        assert_eq!(bus.bytes_available(slot).unwrap(), 4);
        assert_eq!(bus.read_bytes(slot, 64).unwrap().as_ref(), b"ping");
        assert_eq!(bus.bytes_read(slot).unwrap(), 4);

        // Route by the peer name learned from the handshake
        bus.send("cli", b"pong").unwrap();
        assert_eq!(peer.read_direct().unwrap(), b"pong");
        assert_eq!(bus.bytes_written(slot).unwrap(), 4);
    }

    #[test]
    fn test_owner_scoped_callbacks_in_order() {
        let bus = test_bus("callbacks");
        let (_slot, mut peer) = wire_up(&bus, 2, "svc");

        let log = Arc::new(Mutex::new(Vec::new()));
        let connect_log = Arc::clone(&log);
        bus.register_new_connection_callback("svc", move |_, peer| {
            connect_log.lock().push(format!("connect:{}", peer.name));
        });
        let data_log = Arc::clone(&log);
        bus.register_new_data_callback("svc", move |_, items| {
            data_log.lock().push(format!("data:{items}"));
        });
        // A different owner's callback must stay silent
        let other_log = Arc::clone(&log);
        bus.register_new_data_callback("other", move |_, _| {
            other_log.lock().push("other".to_string());
        });

        peer.write(wire::encode_handshake(9, "cli").as_bytes())
            .unwrap();
        peer.write(b"a").unwrap();
        peer.write(b"b").unwrap();
        bus.drain_now();

        assert_eq!(*log.lock(), vec!["connect:cli", "data:2"]);
    }

    #[test]
    fn test_callback_may_register_callbacks() {
        let bus = test_bus("reentrant");
        let (_slot, mut peer) = wire_up(&bus, 6, "svc");

        let log = Arc::new(Mutex::new(Vec::new()));
        let connect_log = Arc::clone(&log);
        let shared = Arc::clone(&bus.shared);
        bus.register_new_connection_callback("svc", move |_, peer| {
            connect_log.lock().push(format!("connect:{}", peer.name));
            // Registering from inside a callback must not deadlock
            let inner_log = Arc::clone(&connect_log);
            shared
                .callbacks
                .lock()
                .entry("svc".to_string())
                .or_default()
                .on_data = Some(Box::new(move |_, items| {
                inner_log.lock().push(format!("data:{items}"));
            }));
        });

        peer.write(wire::encode_handshake(8, "cli").as_bytes())
            .unwrap();
        peer.write(b"x").unwrap();
        bus.drain_now();

        // The data callback installed by the connect callback handled
        // the data event of the same drain pass
        assert_eq!(*log.lock(), vec!["connect:cli", "data:1"]);
    }

    #[test]
    fn test_poll_hook_runs_before_drain() {
        let bus = test_bus("hook");
        let (_slot, mut peer) = wire_up(&bus, 3, "svc");
        let hits = Arc::new(Mutex::new(0u32));
        let hook_hits = Arc::clone(&hits);
        bus.register_poll_hook(move || *hook_hits.lock() += 1);

        peer.write(wire::encode_handshake(5, "cli").as_bytes())
            .unwrap();
        assert_eq!(bus.handle_events(), 1);
        assert_eq!(bus.handle_events(), 0);
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn test_payload_too_large() {
        let bus = test_bus("toolarge");
        let (slot, mut peer) = wire_up(&bus, 4, "svc");
        peer.write(wire::encode_handshake(6, "cli").as_bytes())
            .unwrap();
        bus.drain_now();

        let oversized = vec![0u8; crate::REGION_PAGE + 1];
        assert!(matches!(
            bus.write_bytes(slot, &oversized).unwrap_err(),
            BusError::PayloadTooLarge { .. }
        ));
    }

    #[test]
    fn test_stats_and_close() {
        let bus = test_bus("stats");
        let (slot, mut peer) = wire_up(&bus, 5, "svc");
        peer.write(wire::encode_handshake(11, "cli").as_bytes())
            .unwrap();
        peer.write(b"xyz").unwrap();
        bus.drain_now();
        bus.write_bytes(slot, b"12345").unwrap();

        let stats = bus.channel_stats(slot).unwrap();
        assert_eq!(stats.channel, 5);
        assert_eq!(stats.owner.as_deref(), Some("svc"));
        assert!(stats.connected);
        assert_eq!(stats.bytes_read, 3);
        assert_eq!(stats.bytes_written, 5);
        assert_eq!(stats.bytes_available, 3);
        assert_eq!(stats.pending_outgoing, 1);

        bus.close_channel(slot).unwrap();
        assert!(matches!(
            bus.channel_stats(slot).unwrap_err(),
            BusError::InvalidSlot(_)
        ));
    }

    #[test]
    fn test_nameserver_unavailable() {
        let bus = test_bus("nons");
        assert!(matches!(
            bus.init_service("svc", 1).unwrap_err(),
            BusError::NameserverUnavailable(_)
        ));
    }
}
