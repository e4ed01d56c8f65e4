//! Common network types for the ExaBGP announcer.
//!
//! This crate provides type-safe representations of the network primitives
//! exchanged with the routing daemon:
//!
//! - [`IpPrefix`]: IP network prefixes (CIDR notation, host bits zero)
//! - [`NextHop`]: BGP next hop, either `self` or a literal address
//! - [`is_link_local`]: link-local classification for raw addresses

mod ip;
mod next_hop;

pub use ip::{is_link_local, IpPrefix};
pub use next_hop::NextHop;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("{0} has host bits set")]
    HostBitsSet(String),

    #[error("invalid next hop: {0} (must be 'self' or an IP address)")]
    InvalidNextHop(String),
}
