//! Run the bus nameserver until interrupted.
//!
//!     cargo run --example nameserver

use shmbus::{BusConfig, CancelToken, Nameserver};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut nameserver = Nameserver::start(BusConfig::default())?;
    let cancel = CancelToken::new();
    let stop = cancel.clone();
    ctrlc::set_handler(move || stop.cancel())?;

    nameserver.run(&cancel)?;
    Ok(())
}
