//! Nameserver wire protocol
//!
//! Requests and replies are plain ASCII, space-delimited tokens carried
//! as single ring-buffer items. The format is deliberately trivial so
//! it can be produced and parsed without allocation surprises:
//!
//! ```text
//! SERVICE <name> <channel-count> <pid>   -> CHANNEL_FULL | "<id> <id> ..."
//! CLIENT <service-name>                  -> UNKNOWN_SERVICE | SERVICE_BUSY | "<id> <pid>"
//! ```
//!
//! The handshake token is the reserved first message a client writes on
//! a freshly opened channel to announce itself to the service.

use crate::peer::validate_name;
use crate::{BusError, Result};

/// Tag opening a service registration request
pub const SERVICE_TAG: &str = "SERVICE";
/// Tag opening a client lookup request
pub const CLIENT_TAG: &str = "CLIENT";
/// Reply when the nameserver's channel number pool is exhausted
pub const CHANNEL_FULL_TOKEN: &str = "CHANNEL_FULL";
/// Reply for a lookup of a name that was never registered
pub const UNKNOWN_SERVICE_TOKEN: &str = "UNKNOWN_SERVICE";
/// Reply when the service has no unassigned channel left
pub const SERVICE_BUSY_TOKEN: &str = "SERVICE_BUSY";
/// Reserved first message announcing a new client connection
pub const HANDSHAKE_TOKEN: &str = "**CONNECT**";

/// A request sent to the nameserver over the rendezvous channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Register a service and reserve `channels` channel numbers
    Register { name: String, channels: u32, pid: i32 },
    /// Resolve a service name to a channel number and pid
    Lookup { service: String },
}

impl Request {
    pub fn encode(&self) -> String {
        match self {
            Request::Register { name, channels, pid } => {
                format!("{SERVICE_TAG} {name} {channels} {pid}")
            }
            Request::Lookup { service } => format!("{CLIENT_TAG} {service}"),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut tokens = text.split_ascii_whitespace();
        match tokens.next() {
            Some(SERVICE_TAG) => {
                let name = next_token(&mut tokens, "service name")?;
                validate_name(&name)?;
                let channels = parse_number(&next_token(&mut tokens, "channel count")?)?;
                let pid = parse_number(&next_token(&mut tokens, "pid")?)?;
                expect_end(&mut tokens)?;
                Ok(Request::Register { name, channels, pid })
            }
            Some(CLIENT_TAG) => {
                let service = next_token(&mut tokens, "service name")?;
                validate_name(&service)?;
                expect_end(&mut tokens)?;
                Ok(Request::Lookup { service })
            }
            Some(other) => Err(BusError::Protocol(format!("unknown request tag {other:?}"))),
            None => Err(BusError::Protocol("empty request".to_string())),
        }
    }
}

/// A nameserver reply
///
/// The two numeric reply forms are ambiguous on the wire; the requester
/// decodes against the request it sent, which is why decoding goes
/// through [`Reply::decode_for`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Channel numbers reserved for a registering service
    Channels(Vec<u32>),
    /// Registration denied, the pool is exhausted
    ChannelsExhausted,
    /// Lookup result: channel number and pid of the service
    Endpoint { channel: u32, pid: i32 },
    /// Lookup of an unregistered name
    UnknownService,
    /// The service has no free channel for another client
    ServiceBusy,
}

impl Reply {
    pub fn encode(&self) -> String {
        match self {
            Reply::Channels(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            Reply::ChannelsExhausted => CHANNEL_FULL_TOKEN.to_string(),
            Reply::Endpoint { channel, pid } => format!("{channel} {pid}"),
            Reply::UnknownService => UNKNOWN_SERVICE_TOKEN.to_string(),
            Reply::ServiceBusy => SERVICE_BUSY_TOKEN.to_string(),
        }
    }

    /// Decode a reply in the context of the request that prompted it
    pub fn decode_for(request: &Request, text: &str) -> Result<Self> {
        match request {
            Request::Register { channels, .. } => {
                if text == CHANNEL_FULL_TOKEN {
                    return Ok(Reply::ChannelsExhausted);
                }
                let ids = text
                    .split_ascii_whitespace()
                    .map(parse_number)
                    .collect::<Result<Vec<u32>>>()?;
                if ids.len() != *channels as usize {
                    return Err(BusError::Protocol(format!(
                        "expected {} channel ids, got {}",
                        channels,
                        ids.len()
                    )));
                }
                Ok(Reply::Channels(ids))
            }
            Request::Lookup { .. } => match text {
                UNKNOWN_SERVICE_TOKEN => Ok(Reply::UnknownService),
                SERVICE_BUSY_TOKEN => Ok(Reply::ServiceBusy),
                _ => {
                    let mut tokens = text.split_ascii_whitespace();
                    let channel = parse_number(&next_token(&mut tokens, "channel id")?)?;
                    let pid = parse_number(&next_token(&mut tokens, "service pid")?)?;
                    expect_end(&mut tokens)?;
                    Ok(Reply::Endpoint { channel, pid })
                }
            },
        }
    }
}

/// Build the handshake item a client sends right after connecting
pub fn encode_handshake(pid: i32, client_name: &str) -> String {
    format!("{HANDSHAKE_TOKEN} {pid} {client_name}")
}

/// Parse a drained item as a handshake; `None` for ordinary data
pub fn decode_handshake(item: &[u8]) -> Option<(i32, String)> {
    if !item.starts_with(HANDSHAKE_TOKEN.as_bytes()) {
        return None;
    }
    let text = std::str::from_utf8(item).ok()?;
    let mut tokens = text.split_ascii_whitespace();
    tokens.next(); // the token itself
    let pid = tokens.next()?.parse().ok()?;
    let name = tokens.next()?.to_string();
    validate_name(&name).ok()?;
    Some((pid, name))
}

fn next_token(tokens: &mut std::str::SplitAsciiWhitespace<'_>, what: &str) -> Result<String> {
    tokens
        .next()
        .map(str::to_string)
        .ok_or_else(|| BusError::Protocol(format!("missing {what}")))
}

fn expect_end(tokens: &mut std::str::SplitAsciiWhitespace<'_>) -> Result<()> {
    match tokens.next() {
        None => Ok(()),
        Some(extra) => Err(BusError::Protocol(format!("trailing token {extra:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(token: impl AsRef<str>) -> Result<T> {
    let token = token.as_ref();
    token
        .parse()
        .map_err(|_| BusError::Protocol(format!("bad number {token:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_roundtrip() {
        let req = Request::Register {
            name: "svc".to_string(),
            channels: 2,
            pid: 1234,
        };
        assert_eq!(req.encode(), "SERVICE svc 2 1234");
        assert_eq!(Request::decode("SERVICE svc 2 1234").unwrap(), req);
    }

    #[test]
    fn test_lookup_roundtrip() {
        let req = Request::Lookup {
            service: "echo".to_string(),
        };
        assert_eq!(req.encode(), "CLIENT echo");
        assert_eq!(Request::decode("CLIENT echo").unwrap(), req);
    }

    #[test]
    fn test_malformed_requests() {
        assert!(Request::decode("").is_err());
        assert!(Request::decode("BOGUS x").is_err());
        assert!(Request::decode("SERVICE svc two 1234").is_err());
        assert!(Request::decode("SERVICE svc 2").is_err());
        assert!(Request::decode("CLIENT echo extra").is_err());
    }

    #[test]
    fn test_register_reply_decoding() {
        let req = Request::Register {
            name: "svc".to_string(),
            channels: 2,
            pid: 1,
        };
        assert_eq!(
            Reply::decode_for(&req, "17 18").unwrap(),
            Reply::Channels(vec![17, 18])
        );
        assert_eq!(
            Reply::decode_for(&req, CHANNEL_FULL_TOKEN).unwrap(),
            Reply::ChannelsExhausted
        );
        // Count mismatch is a protocol error
        assert!(Reply::decode_for(&req, "17").is_err());
    }

    #[test]
    fn test_lookup_reply_decoding() {
        let req = Request::Lookup {
            service: "svc".to_string(),
        };
        assert_eq!(
            Reply::decode_for(&req, "17 4242").unwrap(),
            Reply::Endpoint { channel: 17, pid: 4242 }
        );
        assert_eq!(
            Reply::decode_for(&req, UNKNOWN_SERVICE_TOKEN).unwrap(),
            Reply::UnknownService
        );
        assert_eq!(
            Reply::decode_for(&req, SERVICE_BUSY_TOKEN).unwrap(),
            Reply::ServiceBusy
        );
        assert!(Reply::decode_for(&req, "17").is_err());
    }

    #[test]
    fn test_reply_encoding() {
        assert_eq!(Reply::Channels(vec![3, 4, 5]).encode(), "3 4 5");
        assert_eq!(Reply::Endpoint { channel: 9, pid: 77 }.encode(), "9 77");
        assert_eq!(Reply::UnknownService.encode(), UNKNOWN_SERVICE_TOKEN);
    }

    #[test]
    fn test_handshake() {
        let msg = encode_handshake(555, "cli");
        assert_eq!(msg, "**CONNECT** 555 cli");
        assert_eq!(
            decode_handshake(msg.as_bytes()),
            Some((555, "cli".to_string()))
        );
        // Ordinary data never parses as a handshake
        assert_eq!(decode_handshake(b"hello world"), None);
        // A truncated token is data, not a handshake
        assert_eq!(decode_handshake(b"**CONN"), None);
        // Token without the fields is malformed, treated as data
        assert_eq!(decode_handshake(b"**CONNECT**"), None);
    }
}
