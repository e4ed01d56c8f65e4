//! Outbound command codec
//!
//! Renders [`Command`] values into the daemon's line-oriented text API:
//!
//! ```text
//! announce route 69::/32 next-hop self med 10 community [65000:1]
//! withdraw route 69::/32 next-hop self
//! neighbor 10.0.0.2 announce route 10.1.0.0/24 next-hop 10.0.0.1
//! ```
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Only validated prefixes and attributes reach the daemon
//! - SI-10: Information Input Validation - Attribute tokens cannot break line framing

use crate::error::{ApiError, Result};
use exabgp_types::{IpPrefix, NextHop};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// BGP ORIGIN attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Igp => "igp",
            Origin::Egp => "egp",
            Origin::Incomplete => "incomplete",
        }
    }
}

/// Path attributes sent along with an announce
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteAttributes {
    pub next_hop: NextHop,
    pub origin: Option<Origin>,
    pub local_preference: Option<u32>,
    pub med: Option<u32>,
    pub communities: Vec<String>,
    pub as_path: Vec<u32>,
}

impl RouteAttributes {
    /// Attributes carrying only a next hop.
    pub fn with_next_hop(next_hop: NextHop) -> Self {
        Self {
            next_hop,
            ..Self::default()
        }
    }

    /// Reject community tokens that would corrupt the command line.
    ///
    /// # NIST Controls
    /// - SI-10: Information Input Validation
    pub fn validate(&self) -> Result<()> {
        for community in &self.communities {
            let valid = !community.is_empty()
                && community
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_'));
            if !valid {
                return Err(ApiError::Malformed(format!(
                    "invalid community token {:?}",
                    community
                )));
            }
        }
        Ok(())
    }

    fn render_into(&self, out: &mut String) {
        out.push_str(" next-hop ");
        out.push_str(&self.next_hop.to_string());
        if let Some(origin) = self.origin {
            out.push_str(" origin ");
            out.push_str(origin.as_str());
        }
        if let Some(local_pref) = self.local_preference {
            out.push_str(&format!(" local-preference {}", local_pref));
        }
        if let Some(med) = self.med {
            out.push_str(&format!(" med {}", med));
        }
        if !self.communities.is_empty() {
            out.push_str(&format!(" community [{}]", self.communities.join(" ")));
        }
        if !self.as_path.is_empty() {
            let path: Vec<String> = self.as_path.iter().map(|asn| asn.to_string()).collect();
            out.push_str(&format!(" as-path [{}]", path.join(" ")));
        }
    }
}

/// Kind of route change a command requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Announce,
    Withdraw,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Announce => f.write_str("announce"),
            CommandKind::Withdraw => f.write_str("withdraw"),
        }
    }
}

/// Instruction written to the daemon's command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start advertising a prefix
    Announce {
        prefix: IpPrefix,
        attributes: RouteAttributes,
    },
    /// Stop advertising a prefix
    Withdraw { prefix: IpPrefix, next_hop: NextHop },
    /// Scope the inner command to a single peer
    Neighbor { peer: IpAddr, command: Box<Command> },
}

impl Command {
    pub fn announce(prefix: IpPrefix, attributes: RouteAttributes) -> Self {
        Command::Announce { prefix, attributes }
    }

    pub fn withdraw(prefix: IpPrefix, next_hop: NextHop) -> Self {
        Command::Withdraw { prefix, next_hop }
    }

    /// Restrict this command to one neighbor.
    pub fn for_neighbor(self, peer: IpAddr) -> Self {
        match self {
            Command::Neighbor { command, .. } => Command::Neighbor { peer, command },
            other => Command::Neighbor {
                peer,
                command: Box::new(other),
            },
        }
    }

    pub fn prefix(&self) -> &IpPrefix {
        match self {
            Command::Announce { prefix, .. } | Command::Withdraw { prefix, .. } => prefix,
            Command::Neighbor { command, .. } => command.prefix(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Announce { .. } => CommandKind::Announce,
            Command::Withdraw { .. } => CommandKind::Withdraw,
            Command::Neighbor { command, .. } => command.kind(),
        }
    }

    /// Render the command without its line terminator.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(64);
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Command::Announce { prefix, attributes } => {
                out.push_str("announce route ");
                out.push_str(&prefix.to_string());
                attributes.render_into(out);
            }
            Command::Withdraw { prefix, next_hop } => {
                out.push_str("withdraw route ");
                out.push_str(&prefix.to_string());
                out.push_str(" next-hop ");
                out.push_str(&next_hop.to_string());
            }
            Command::Neighbor { peer, command } => {
                out.push_str("neighbor ");
                out.push_str(&peer.to_string());
                out.push(' ');
                command.render_into(out);
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn prefix(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    #[test]
    fn test_render_announce_minimal() {
        let cmd = Command::announce(prefix("69::/32"), RouteAttributes::default());
        assert_eq!(cmd.render(), "announce route 69::/32 next-hop self");
    }

    #[test]
    fn test_render_withdraw() {
        let nh: NextHop = "2000:69::1".parse().unwrap();
        let cmd = Command::withdraw(prefix("70::/32"), nh);
        assert_eq!(cmd.render(), "withdraw route 70::/32 next-hop 2000:69::1");
        assert_eq!(cmd.kind(), CommandKind::Withdraw);
    }

    #[test]
    fn test_render_full_attributes() {
        let attributes = RouteAttributes {
            next_hop: "10.0.0.1".parse().unwrap(),
            origin: Some(Origin::Igp),
            local_preference: Some(200),
            med: Some(10),
            communities: vec!["65000:1".to_string(), "no-export".to_string()],
            as_path: vec![65000, 65001],
        };
        let cmd = Command::announce(prefix("10.1.0.0/24"), attributes);
        assert_eq!(
            cmd.render(),
            "announce route 10.1.0.0/24 next-hop 10.0.0.1 origin igp local-preference 200 \
             med 10 community [65000:1 no-export] as-path [65000 65001]"
        );
    }

    #[test]
    fn test_render_neighbor_scoped() {
        let cmd = Command::withdraw(prefix("10.1.0.0/24"), NextHop::SelfAddress)
            .for_neighbor("10.0.0.2".parse().unwrap());
        assert_eq!(
            cmd.render(),
            "neighbor 10.0.0.2 withdraw route 10.1.0.0/24 next-hop self"
        );
        assert_eq!(cmd.prefix(), &prefix("10.1.0.0/24"));

        let rescoped = cmd.for_neighbor("10.0.0.3".parse().unwrap());
        assert!(rescoped.render().starts_with("neighbor 10.0.0.3 withdraw"));
    }

    #[test]
    fn test_validate_communities() {
        let mut attributes = RouteAttributes::default();
        attributes.communities = vec!["65000:1".to_string()];
        assert!(attributes.validate().is_ok());

        attributes.communities = vec!["65000:1\nwithdraw route 0.0.0.0/0".to_string()];
        assert!(attributes.validate().is_err());

        attributes.communities = vec!["".to_string()];
        assert!(attributes.validate().is_err());
    }

    #[test]
    fn test_attributes_deserialize_defaults() {
        let attributes: RouteAttributes =
            serde_json::from_str(r#"{"med": 5, "origin": "egp"}"#).unwrap();
        assert_eq!(attributes.next_hop, NextHop::SelfAddress);
        assert_eq!(attributes.med, Some(5));
        assert_eq!(attributes.origin, Some(Origin::Egp));
        assert!(attributes.communities.is_empty());
    }
}
