//! Echo client: connects to the "echo" service and round-trips a few
//! messages. Start the nameserver and echo_service examples first.
//!
//!     cargo run --example echo_client [client-name]

use shmbus::{Bus, BusConfig};
use std::time::{Duration, Instant};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("client-{}", std::process::id()));

    let bus = Bus::new(BusConfig::default())?;
    let slot = bus.connect_client(&name, "echo")?;
    println!("{name} connected on slot {slot}");

    for i in 0..5 {
        let message = format!("hello {i} from {name}");
        bus.write_bytes(slot, message.as_bytes())?;

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let data = bus.read_bytes(slot, shmbus::SCRATCH_LEN)?;
            if !data.is_empty() {
                println!("echoed: {}", String::from_utf8_lossy(&data));
                break;
            }
            if Instant::now() > deadline {
                anyhow::bail!("no echo within 2s");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    let stats = bus.channel_stats(slot)?;
    println!(
        "done: {} bytes out, {} bytes in",
        stats.bytes_written, stats.bytes_read
    );
    Ok(())
}
