//! Peer identity attached to a channel slot

use crate::{BusError, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on service and client names.
///
/// Names travel as single whitespace-delimited wire tokens and are
/// copied into fixed scratch storage on the drain path, so the bound is
/// part of the protocol contract.
pub const MAX_NAME_LEN: usize = 128;

/// The process on the far end of a channel.
///
/// Written only by the handshake message processed during event
/// delivery, or by the client side right after a successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer process id (signal target for delivery notification)
    pub pid: i32,
    /// Peer name as announced in the handshake
    pub name: String,
}

impl PeerInfo {
    /// Create a peer record, validating the name
    pub fn new(pid: i32, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { pid, name })
    }
}

/// Validate a service or client name against the wire contract
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() > MAX_NAME_LEN {
        "longer than the 128 byte limit"
    } else if name.bytes().any(|b| b.is_ascii_whitespace()) {
        "contains whitespace"
    } else if name.contains('\0') {
        "contains a nul byte"
    } else {
        return Ok(());
    };

    Err(BusError::InvalidName {
        name: name.to_string(),
        reason,
    })
}
