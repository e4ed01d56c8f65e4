//! BGP next hop as understood by the daemon command syntax.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Next hop attached to announce/withdraw commands.
///
/// `self` asks the daemon to use the local session address. A literal
/// address is always rendered in compressed form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NextHop {
    #[default]
    SelfAddress,
    Address(IpAddr),
}

impl NextHop {
    /// Returns the literal address, if any.
    pub const fn address(&self) -> Option<&IpAddr> {
        match self {
            NextHop::SelfAddress => None,
            NextHop::Address(addr) => Some(addr),
        }
    }
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextHop::SelfAddress => f.write_str("self"),
            NextHop::Address(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for NextHop {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("self") {
            return Ok(NextHop::SelfAddress);
        }
        s.parse::<IpAddr>()
            .map(NextHop::Address)
            .map_err(|_| ParseError::InvalidNextHop(s.to_string()))
    }
}

impl From<IpAddr> for NextHop {
    fn from(addr: IpAddr) -> Self {
        NextHop::Address(addr)
    }
}

impl TryFrom<String> for NextHop {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NextHop> for String {
    fn from(next_hop: NextHop) -> Self {
        next_hop.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_self_is_case_insensitive() {
        assert_eq!("sELf".parse::<NextHop>().unwrap(), NextHop::SelfAddress);
        assert_eq!(NextHop::SelfAddress.to_string(), "self");
    }

    #[test]
    fn test_address_is_compressed() {
        let nh: NextHop = "0069:0000:0000:0000:0000:0000:0000:0001".parse().unwrap();
        assert_eq!(nh.to_string(), "69::1");
        assert_eq!(nh.address(), Some(&"69::1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_invalid_next_hop() {
        assert_eq!(
            "cooper69".parse::<NextHop>(),
            Err(ParseError::InvalidNextHop("cooper69".to_string()))
        );
    }
}
