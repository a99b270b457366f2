//! Error types for the shared-memory bus

use thiserror::Error;

/// Bus error taxonomy
///
/// Nothing here is fatal to the process: shared-memory and nameserver
/// failures terminate only the requested operation, and precondition
/// violations (oversized names or payloads) come back as recoverable
/// error results.
#[derive(Error, Debug)]
pub enum BusError {
    /// Shared memory error (segment creation/attachment failure)
    #[error("shared memory error: {0}")]
    Shm(String),

    /// Shared memory region not found
    #[error("shared memory region not found: {0}")]
    RegionNotFound(String),

    /// No free slot left in the local channel registry
    #[error("no free channel slot, registry capacity is {capacity}")]
    SlotsExhausted { capacity: usize },

    /// The nameserver has no channel numbers left to hand out
    #[error("nameserver channel pool exhausted")]
    ChannelPoolExhausted,

    /// Lookup for a name the nameserver has never seen
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The service has no unassigned channel left for a new client
    #[error("service busy, no free channel: {0}")]
    ServiceBusy(String),

    /// The nameserver could not be reached (missing pidfile, dead pid)
    #[error("nameserver unavailable: {0}")]
    NameserverUnavailable(String),

    /// Invalid service or client name
    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Payload does not fit the data arena of a ring
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Delay buffer would exceed its configured maximum
    #[error("delay buffer overflow: {needed} bytes needed, maximum is {max}")]
    DelayOverflow { needed: usize, max: usize },

    /// No live channel has a connected peer under that name
    #[error("no connected peer named {0:?}")]
    NotConnected(String),

    /// Slot index out of range or not in use
    #[error("invalid or vacant slot: {0}")]
    InvalidSlot(usize),

    /// Malformed wire message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bounded wait expired
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Operation cancelled through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// Check if the error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        match self {
            BusError::Timeout { .. } => true,
            BusError::ServiceBusy(_) => true,
            BusError::DelayOverflow { .. } => true,
            BusError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}
