//! Echo service: registers "echo" with four channels and bounces every
//! payload back to its sender. Start the nameserver example first.
//!
//!     cargo run --example echo_service

use shmbus::{Bus, BusConfig, BusEvent};
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let bus = Bus::new(BusConfig::default())?;
    let slots = bus.init_service("echo", 4)?;
    println!("echo service up on {} channels", slots.len());

    let cancel = bus.cancel_token();
    let stop = cancel.clone();
    ctrlc::set_handler(move || stop.cancel())?;

    let events = bus.events();
    while !cancel.is_cancelled() {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(BusEvent::NewConnection { slot, peer }) => {
                println!("client {} (pid {}) on slot {slot}", peer.name, peer.pid);
            }
            Ok(BusEvent::NewData { slot, .. }) => {
                let data = bus.read_bytes(slot, shmbus::SCRATCH_LEN)?;
                if !data.is_empty() {
                    bus.write_bytes(slot, &data)?;
                }
            }
            Ok(BusEvent::Wake) => {}
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}
