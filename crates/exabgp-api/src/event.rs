//! Inbound event codec
//!
//! Decodes one line of the daemon's JSON API output into an [`Event`].
//! Decoding is strictly per line: any failure is returned as a local
//! [`ApiError`] and never affects the lines around it.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Peer state and route updates are surfaced as typed events
//! - SI-10: Information Input Validation - Version, shape and prefix validation per line

use crate::error::{ApiError, Result};
use exabgp_types::IpPrefix;
use serde_json::{Map, Value};
use std::net::IpAddr;
use tracing::debug;

/// API major version this decoder understands
pub const SUPPORTED_MAJOR_VERSION: &str = "4";

/// Address families converted into [`FibPrefix`] records
pub const UNICAST_FAMILIES: [&str; 2] = ["ipv4 unicast", "ipv6 unicast"];

/// Plain-text replies the daemon writes after processing a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Done,
    Error,
    Shutdown,
}

/// BGP session state reported in `state` messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Up,
    Down { reason: Option<String> },
    Other(String),
}

/// Whether an update was received from or sent to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Receive,
    Send,
}

/// What the FIB handler should do with a decoded prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FibOperation {
    Add,
    Remove,
    /// Remove everything learned via `next_hop` (peer went down)
    RemoveAll,
}

/// A route learned from, or withdrawn by, a peer
///
/// Immutable once decoded. `attributes` carries the update's path
/// attributes exactly as the daemon reported them.
#[derive(Debug, Clone, PartialEq)]
pub struct FibPrefix {
    pub prefix: IpPrefix,
    pub next_hop: IpAddr,
    pub operation: FibOperation,
    pub peer: IpAddr,
    pub direction: Direction,
    pub attributes: Map<String, Value>,
}

/// Peer session change
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborChange {
    pub peer: IpAddr,
    pub local: Option<IpAddr>,
    pub state: PeerState,
}

impl NeighborChange {
    /// FIB operation implied by the state change, if any.
    ///
    /// A peer going down invalidates every route learned through it.
    pub fn fib_operation(&self) -> Option<FibPrefix> {
        match self.state {
            PeerState::Down { .. } => Some(FibPrefix {
                prefix: IpPrefix::DEFAULT_V6,
                next_hop: self.peer,
                operation: FibOperation::RemoveAll,
                peer: self.peer,
                direction: Direction::Receive,
                attributes: Map::new(),
            }),
            _ => None,
        }
    }
}

/// Parsed `update` message
#[derive(Debug, Clone, PartialEq)]
pub struct RouteUpdate {
    pub peer: IpAddr,
    pub direction: Direction,
    pub prefixes: Vec<FibPrefix>,
}

/// A decoded line from the event channel
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ack(Ack),
    Neighbor(NeighborChange),
    Update(RouteUpdate),
    /// Any message type this decoder does not interpret
    Other { kind: String, message: Value },
}

/// Decode one line of daemon output.
///
/// # Errors
///
/// Every error returned here is local to the line (see [`ApiError::is_local`]).
pub fn decode_line(line: &str) -> Result<Event> {
    let line = line.trim();
    match line {
        "" => return Err(ApiError::Malformed("empty line".to_string())),
        "done" => return Ok(Event::Ack(Ack::Done)),
        "error" => return Ok(Event::Ack(Ack::Error)),
        "shutdown" => return Ok(Event::Ack(Ack::Shutdown)),
        _ => {}
    }

    let message: Value = serde_json::from_str(line)?;
    decode_message(message)
}

/// Decode an already-parsed JSON message.
pub fn decode_message(message: Value) -> Result<Event> {
    let object = message
        .as_object()
        .ok_or_else(|| ApiError::Malformed("message is not a JSON object".to_string()))?;

    let version = str_field(object, "exabgp")?;
    if version.split('.').next() != Some(SUPPORTED_MAJOR_VERSION) {
        return Err(ApiError::UnsupportedVersion(version.to_string()));
    }

    let kind = str_field(object, "type")?.to_ascii_lowercase();
    if !object.contains_key("neighbor") {
        debug!(kind = %kind, "Ignoring message without neighbor section");
        return Ok(Event::Other { kind, message });
    }

    if kind == "state" {
        decode_state(object).map(Event::Neighbor)
    } else if kind == "update" {
        decode_update(object).map(Event::Update)
    } else {
        Ok(Event::Other { kind, message })
    }
}

fn decode_state(object: &Map<String, Value>) -> Result<NeighborChange> {
    let neighbor = object_field(object, "neighbor")?;
    let address = object_field(neighbor, "address")?;
    let peer = ip_field(address, "peer")?;
    let local = match address.get("local") {
        Some(_) => Some(ip_field(address, "local")?),
        None => None,
    };

    let state = match str_field(neighbor, "state")?.to_ascii_lowercase().as_str() {
        "connected" => PeerState::Connected,
        "up" => PeerState::Up,
        "down" => PeerState::Down {
            reason: neighbor
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        other => PeerState::Other(other.to_string()),
    };

    Ok(NeighborChange { peer, local, state })
}

fn decode_update(object: &Map<String, Value>) -> Result<RouteUpdate> {
    let neighbor = object_field(object, "neighbor")?;
    let direction = match str_field(neighbor, "direction")? {
        "receive" => Direction::Receive,
        "send" => Direction::Send,
        other => {
            return Err(ApiError::Malformed(format!("unknown direction {:?}", other)));
        }
    };
    let peer = ip_field(object_field(neighbor, "address")?, "peer")?;
    let update = object_field(object_field(neighbor, "message")?, "update")?;

    let attributes = match update.get("attribute") {
        Some(Value::Object(attributes)) => attributes.clone(),
        _ => Map::new(),
    };

    let mut prefixes = Vec::new();
    for (operation, families) in update {
        let operation = match operation.as_str() {
            "announce" => FibOperation::Add,
            "withdraw" => FibOperation::Remove,
            _ => continue,
        };
        let families = families
            .as_object()
            .ok_or_else(|| ApiError::Malformed(format!("{:?} section is not an object", operation)))?;

        for (family, routes) in families {
            if !UNICAST_FAMILIES.contains(&family.as_str()) {
                debug!(peer = %peer, family = %family, "Ignoring routes for unsupported family");
                continue;
            }

            match operation {
                FibOperation::Add => {
                    let by_next_hop = routes.as_object().ok_or_else(|| {
                        ApiError::Malformed(format!("announce {} is not keyed by next-hop", family))
                    })?;
                    for (next_hop, nlris) in by_next_hop {
                        let next_hop: IpAddr = next_hop.parse().map_err(|_| {
                            ApiError::Malformed(format!("invalid next-hop {:?}", next_hop))
                        })?;
                        for prefix in nlri_list(nlris)? {
                            prefixes.push(FibPrefix {
                                prefix,
                                next_hop,
                                operation,
                                peer,
                                direction,
                                attributes: attributes.clone(),
                            });
                        }
                    }
                }
                // Withdraws carry no next-hop; the peer is the only one we know.
                _ => {
                    for prefix in nlri_list(routes)? {
                        prefixes.push(FibPrefix {
                            prefix,
                            next_hop: peer,
                            operation,
                            peer,
                            direction,
                            attributes: attributes.clone(),
                        });
                    }
                }
            }
        }
    }

    Ok(RouteUpdate {
        peer,
        direction,
        prefixes,
    })
}

fn nlri_list(value: &Value) -> Result<Vec<IpPrefix>> {
    let entries = value
        .as_array()
        .ok_or_else(|| ApiError::Malformed("NLRI list is not an array".to_string()))?;

    entries
        .iter()
        .map(|entry| {
            let nlri = match entry {
                Value::String(nlri) => nlri.as_str(),
                Value::Object(fields) => fields
                    .get("nlri")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ApiError::Malformed("NLRI entry without nlri".to_string()))?,
                _ => return Err(ApiError::Malformed("unexpected NLRI entry".to_string())),
            };
            nlri.parse::<IpPrefix>()
                .map_err(|e| ApiError::Malformed(format!("invalid NLRI {:?}: {}", nlri, e)))
        })
        .collect()
}

fn object_field<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a Map<String, Value>> {
    object
        .get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| ApiError::Malformed(format!("missing object {:?}", key)))
}

fn str_field<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Malformed(format!("missing string {:?}", key)))
}

fn ip_field(object: &Map<String, Value>, key: &str) -> Result<IpAddr> {
    let raw = str_field(object, key)?;
    raw.parse()
        .map_err(|_| ApiError::Malformed(format!("invalid address {:?} in {:?}", raw, key)))
}
