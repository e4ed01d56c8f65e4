//! IP prefix type with strict parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Returns true if the address is link-local (169.254.0.0/16 or fe80::/10).
pub fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// An IP network in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// The network address never has host bits set; `10.0.0.1/24` is rejected
/// rather than silently masked. Ordering sorts every IPv4 prefix before any
/// IPv6 prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// IPv4 default route.
    pub const DEFAULT_V4: Self = IpPrefix {
        address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        prefix_len: 0,
    };

    /// IPv6 default route.
    pub const DEFAULT_V6: Self = IpPrefix {
        address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        prefix_len: 0,
    };

    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6) or if the address has host bits set.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = max_len(&address);
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len, max_len, address
            )));
        }

        let prefix = IpPrefix {
            address,
            prefix_len,
        };
        if prefix.masked(&address) != address {
            return Err(ParseError::HostBitsSet(format!("{}/{}", address, prefix_len)));
        }
        Ok(prefix)
    }

    /// Creates the host route (/32 or /128) covering a single address.
    pub fn host(address: IpAddr) -> Self {
        IpPrefix {
            prefix_len: max_len(&address),
            address,
        }
    }

    /// Returns the network address of this prefix.
    pub const fn address(&self) -> &IpAddr {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns 4 or 6.
    pub const fn version(&self) -> u8 {
        match self.address {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns true if the network sits inside the link-local range.
    pub fn is_link_local(&self) -> bool {
        let range = match self.address {
            IpAddr::V4(_) => IpPrefix {
                address: IpAddr::V4(Ipv4Addr::new(169, 254, 0, 0)),
                prefix_len: 16,
            },
            IpAddr::V6(_) => IpPrefix {
                address: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0)),
                prefix_len: 10,
            },
        };
        range.prefix_len <= self.prefix_len && range.contains(&self.address)
    }

    /// Returns true if `addr` falls within this network.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        same_family(&self.address, addr) && self.masked(addr) == self.address
    }

    /// Returns true if either network contains the other.
    pub fn overlaps(&self, other: &IpPrefix) -> bool {
        self.contains(&other.address) || other.contains(&self.address)
    }

    fn masked(&self, addr: &IpAddr) -> IpAddr {
        match addr {
            IpAddr::V4(v4) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                IpAddr::V4(Ipv4Addr::from(u32::from(*v4) & mask))
            }
            IpAddr::V6(v6) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                IpAddr::V6(Ipv6Addr::from(u128::from(*v6) & mask))
            }
        }
    }
}

fn max_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn same_family(a: &IpAddr, b: &IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ip_prefix_parse() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 24);
        assert_eq!(prefix.version(), 4);

        let v6_prefix: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert!(v6_prefix.is_ipv6());
        assert_eq!(v6_prefix.prefix_len(), 32);
    }

    #[test]
    fn test_host_bits_rejected() {
        assert_eq!(
            "10.0.0.1/24".parse::<IpPrefix>(),
            Err(ParseError::HostBitsSet("10.0.0.1/24".to_string()))
        );
        assert!("69::1/32".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
        assert!("cooper/69".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_ip_prefix_default() {
        assert!("0.0.0.0/0".parse::<IpPrefix>().unwrap().is_default());
        assert!("::/0".parse::<IpPrefix>().unwrap().is_default());
        assert_eq!("::/0".parse::<IpPrefix>().unwrap(), IpPrefix::DEFAULT_V6);
    }

    #[test]
    fn test_contains_and_overlaps() {
        let summary: IpPrefix = "69::/32".parse().unwrap();
        let subnet: IpPrefix = "69::/64".parse().unwrap();
        let other: IpPrefix = "14:69::/64".parse().unwrap();
        let v4: IpPrefix = "6.9.6.0/24".parse().unwrap();

        assert!(summary.contains(&"69::69".parse().unwrap()));
        assert!(summary.overlaps(&subnet));
        assert!(subnet.overlaps(&summary));
        assert!(!summary.overlaps(&other));
        assert!(!summary.overlaps(&v4));
        assert!(IpPrefix::DEFAULT_V4.overlaps(&v4));
    }

    #[test]
    fn test_link_local() {
        assert!("fe80::/64".parse::<IpPrefix>().unwrap().is_link_local());
        assert!("169.254.69.0/24".parse::<IpPrefix>().unwrap().is_link_local());
        assert!(!"69::/64".parse::<IpPrefix>().unwrap().is_link_local());
        assert!(!"6.9.6.0/24".parse::<IpPrefix>().unwrap().is_link_local());

        assert!(is_link_local(&"fe80::69".parse().unwrap()));
        assert!(is_link_local(&"169.254.69.69".parse().unwrap()));
        assert!(!is_link_local(&"69::69".parse().unwrap()));
    }

    #[test]
    fn test_ordering_v4_first() {
        let mut prefixes: Vec<IpPrefix> = ["70::/32", "10.0.0.0/8", "69::/32"]
            .iter()
            .map(|p| p.parse().unwrap())
            .collect();
        prefixes.sort();
        let rendered: Vec<String> = prefixes.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["10.0.0.0/8", "69::/32", "70::/32"]);
    }

    #[test]
    fn test_serde_as_string() {
        let prefix: IpPrefix = "192.168.0.0/16".parse().unwrap();
        let json = serde_json::to_string(&prefix).unwrap();
        assert_eq!(json, "\"192.168.0.0/16\"");
        let back: IpPrefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prefix);
        assert!(serde_json::from_str::<IpPrefix>("\"192.168.0.1/16\"").is_err());
    }
}
