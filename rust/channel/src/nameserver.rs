//! The nameserver: rendezvous endpoint, service table and channel pool
//!
//! Exactly one nameserver runs per bus. It owns the well-known
//! rendezvous channel, publishes its pid so requesters know where to
//! send wake signals, and hands out channel numbers from a bounded
//! allocate-only pool. Request handling is a pure state transition so
//! the protocol can be tested without shared memory underneath.

use crate::events::{BusEvent, SignalListener};
use crate::registry::{Channel, Role};
use crate::{CHANNEL_ID_POOL, NAMESERVER_CHANNEL};
use shmbus_core::wire::{Reply, Request};
use shmbus_core::{BusConfig, BusError, CancelToken, Deadline, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const IDLE_WAIT: Duration = Duration::from_millis(100);

struct ServiceEntry {
    pid: i32,
    channels: Vec<u32>,
    next_unassigned: usize,
}

/// The per-bus rendezvous service
pub struct Nameserver {
    config: BusConfig,
    channel: Channel,
    services: HashMap<String, ServiceEntry>,
    next_channel: u32,
    wake_rx: Option<flume::Receiver<BusEvent>>,
    _listener: Option<SignalListener>,
}

impl Nameserver {
    /// Create the rendezvous channel, start the wake listener and
    /// publish the pidfile, in that order, so no requester can signal
    /// a process that is not yet listening.
    pub fn start(config: BusConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.runtime_dir)?;
        let channel = Channel::open(NAMESERVER_CHANNEL, Role::Owner, &config)?;

        let (listener, wake_rx) = if config.deliver_signals {
            let (tx, rx) = flume::unbounded();
            (Some(SignalListener::spawn(tx)?), Some(rx))
        } else {
            (None, None)
        };

        let pid = std::process::id();
        std::fs::write(config.pidfile(), format!("{pid}\n"))?;
        info!(pid, pidfile = %config.pidfile().display(), "nameserver up");

        Ok(Self {
            config,
            channel,
            services: HashMap::new(),
            next_channel: 1,
            wake_rx,
            _listener: listener,
        })
    }

    /// Answer one request; pure against the service table and pool
    fn handle(&mut self, request: &Request) -> Reply {
        match request {
            Request::Register {
                name,
                channels,
                pid,
            } => {
                let count = *channels;
                let remaining = CHANNEL_ID_POOL + 1 - self.next_channel;
                if count > remaining {
                    warn!(name = %name, count, remaining, "channel pool exhausted");
                    return Reply::ChannelsExhausted;
                }
                let ids: Vec<u32> = (self.next_channel..self.next_channel + count).collect();
                self.next_channel += count;
                if self.services.contains_key(name.as_str()) {
                    // Re-registration after a restart; old numbers stay
                    // burned, the pool never recycles.
                    warn!(name = %name, "service re-registered");
                }
                info!(name = %name, pid, ?ids, "service registered");
                self.services.insert(
                    name.clone(),
                    ServiceEntry {
                        pid: *pid,
                        channels: ids.clone(),
                        next_unassigned: 0,
                    },
                );
                Reply::Channels(ids)
            }
            Request::Lookup { service } => match self.services.get_mut(service.as_str()) {
                None => Reply::UnknownService,
                Some(entry) => {
                    if entry.next_unassigned == entry.channels.len() {
                        debug!(service = %service, "all channels assigned");
                        return Reply::ServiceBusy;
                    }
                    let channel = entry.channels[entry.next_unassigned];
                    entry.next_unassigned += 1;
                    debug!(service = %service, channel, pid = entry.pid, "client assigned");
                    Reply::Endpoint {
                        channel,
                        pid: entry.pid,
                    }
                }
            },
        }
    }

    /// Drain and answer every request currently in the rendezvous ring
    pub fn serve_pending(&mut self) -> Result<usize> {
        let mut served = 0;
        loop {
            let item = match self.channel.read_direct() {
                Ok(item) => item,
                Err(e) if e.is_empty_state() => break,
                Err(e) => return Err(BusError::Protocol(format!("rendezvous read: {e}"))),
            };
            let request = match std::str::from_utf8(&item)
                .map_err(|_| BusError::Protocol("non-utf8 request".to_string()))
                .and_then(|text| Request::decode(text))
            {
                Ok(request) => request,
                Err(e) => {
                    // The requester gets no reply and will time out
                    warn!(error = %e, "dropping malformed request");
                    continue;
                }
            };
            let reply = self.handle(&request);
            self.send_reply(&reply)?;
            served += 1;
        }
        Ok(served)
    }

    fn send_reply(&mut self, reply: &Reply) -> Result<()> {
        let deadline = Deadline::after(self.config.send_timeout);
        let encoded = reply.encode();
        loop {
            match self.channel.write(encoded.as_bytes()) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    if deadline.expired() {
                        return Err(BusError::Timeout {
                            timeout_ms: deadline.budget_ms(),
                        });
                    }
                    std::thread::sleep(self.config.poll_interval);
                }
                Err(e) => return Err(BusError::Protocol(format!("reply write: {e}"))),
            }
        }
    }

    /// Serve until cancelled, sleeping between wakeups
    pub fn run(&mut self, cancel: &CancelToken) -> Result<()> {
        while !cancel.is_cancelled() {
            self.serve_pending()?;
            match &self.wake_rx {
                Some(rx) => {
                    let _ = rx.recv_timeout(IDLE_WAIT);
                }
                None => std::thread::sleep(self.config.poll_interval),
            }
        }
        info!("nameserver shutting down");
        Ok(())
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Channel numbers still available in the pool
    pub fn pool_remaining(&self) -> u32 {
        CHANNEL_ID_POOL + 1 - self.next_channel
    }
}

impl Drop for Nameserver {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.config.pidfile());
    }
}
