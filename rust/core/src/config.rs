//! Bus configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration shared by every bus endpoint
///
/// All endpoints that want to talk to each other must agree on
/// `shm_prefix` and `runtime_dir`; the timeouts are local policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Prefix for shared memory object names
    pub shm_prefix: String,
    /// Directory holding the nameserver pidfile and lock file
    pub runtime_dir: PathBuf,
    /// Bound on the wait for a nameserver reply
    pub reply_timeout: Duration,
    /// Bound on retries when a ring is full or mid-read
    pub send_timeout: Duration,
    /// Sleep between bounded-wait polls
    pub poll_interval: Duration,
    /// Initial delay buffer allocation per slot
    pub delay_buffer_initial: usize,
    /// Hard maximum a delay buffer may grow to
    pub delay_buffer_max: usize,
    /// Send delivery signals and run the signal listener thread.
    /// Hosts that drive the bus purely through the poll hook can turn
    /// this off.
    pub deliver_signals: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            shm_prefix: "shmbus".to_string(),
            runtime_dir: std::env::temp_dir(),
            reply_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_micros(500),
            delay_buffer_initial: 8 * 1024,
            delay_buffer_max: 1024 * 1024,
            deliver_signals: true,
        }
    }
}

impl BusConfig {
    /// Shared memory object name for a region id
    pub fn region_name(&self, id: u32) -> String {
        format!("/{}-{}", self.shm_prefix, id)
    }

    /// Well-known location of the nameserver's published pid
    pub fn pidfile(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}-nameserver.pid", self.shm_prefix))
    }

    /// Lock file serializing nameserver requests
    pub fn lockfile(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}-nameserver.lock", self.shm_prefix))
    }
}
