//! Client side of the nameserver rendezvous
//!
//! Everyone shares one rendezvous channel pair, so requests from
//! different processes must be serialized: a requester takes an
//! exclusive lock on the well-known lock file, writes its request,
//! signals the nameserver and polls the reply ring until the reply
//! arrives or the deadline expires. The nameserver's pid comes from the
//! pidfile it publishes at startup.

use crate::events;
use crate::registry::Channel;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use shmbus_core::wire::{Reply, Request};
use shmbus_core::{BusConfig, BusError, CancelToken, Deadline, Result};
use std::fs::{File, OpenOptions};
use std::thread;
use tracing::debug;

/// Read the nameserver's published pid
pub fn read_server_pid(config: &BusConfig) -> Result<i32> {
    let path = config.pidfile();
    let text = std::fs::read_to_string(&path).map_err(|e| {
        BusError::NameserverUnavailable(format!("pidfile {}: {e}", path.display()))
    })?;
    text.trim().parse().map_err(|_| {
        BusError::NameserverUnavailable(format!(
            "pidfile {} holds {:?}, not a pid",
            path.display(),
            text.trim()
        ))
    })
}

/// Exclusive hold on the rendezvous channel, released on drop
pub struct RendezvousLock {
    _flock: Flock<File>,
}

impl std::fmt::Debug for RendezvousLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousLock").finish_non_exhaustive()
    }
}

impl RendezvousLock {
    /// Acquire the lock, polling until `deadline` or cancellation
    pub fn acquire(config: &BusConfig, deadline: &Deadline, cancel: &CancelToken) -> Result<Self> {
        let path = config.lockfile();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => return Ok(Self { _flock: flock }),
                Err((_, Errno::EAGAIN)) => wait_step(deadline, cancel, config)?,
                Err((_, errno)) => return Err(BusError::Io(errno.into())),
            }
        }
    }
}

/// One serialized request/reply exchange with the nameserver
pub fn exchange(
    channel: &mut Channel,
    request: &Request,
    server_pid: i32,
    config: &BusConfig,
    cancel: &CancelToken,
) -> Result<Reply> {
    let deadline = Deadline::after(config.reply_timeout);
    let _lock = RendezvousLock::acquire(config, &deadline, cancel)?;

    let encoded = request.encode();
    debug!(request = %encoded, server_pid, "nameserver request");
    loop {
        match channel.write(encoded.as_bytes()) {
            Ok(()) => break,
            Err(e) if e.is_transient() => wait_step(&deadline, cancel, config)?,
            Err(e) => {
                return Err(BusError::NameserverUnavailable(format!(
                    "rendezvous ring rejected request: {e}"
                )))
            }
        }
    }
    if config.deliver_signals {
        events::notify(server_pid).map_err(|e| {
            BusError::NameserverUnavailable(format!("waking pid {server_pid}: {e}"))
        })?;
    }

    loop {
        match channel.read_direct() {
            Ok(item) => {
                let text = std::str::from_utf8(&item)
                    .map_err(|_| BusError::Protocol("non-utf8 nameserver reply".to_string()))?;
                debug!(reply = text, "nameserver reply");
                return Reply::decode_for(request, text);
            }
            Err(e) if e.is_empty_state() => wait_step(&deadline, cancel, config)?,
            Err(e) => return Err(BusError::Protocol(format!("reply read failed: {e}"))),
        }
    }
}

fn wait_step(deadline: &Deadline, cancel: &CancelToken, config: &BusConfig) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BusError::Cancelled);
    }
    if deadline.expired() {
        return Err(BusError::Timeout {
            timeout_ms: deadline.budget_ms(),
        });
    }
    thread::sleep(config.poll_interval);
    Ok(())
}
