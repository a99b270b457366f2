//! shmbus - Core Module
//!
//! Shared types for the shared-memory message bus: the error taxonomy,
//! peer identity, the nameserver wire protocol, configuration and
//! cancellation primitives.

pub mod cancel;
pub mod config;
pub mod error;
pub mod peer;
pub mod wire;

pub use cancel::{CancelToken, Deadline};
pub use config::BusConfig;
pub use error::{BusError, Result};
pub use peer::{validate_name, PeerInfo, MAX_NAME_LEN};

/// Current version of the bus protocol
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
