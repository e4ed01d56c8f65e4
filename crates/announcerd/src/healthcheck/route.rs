//! IGP reachability probe.
//!
//! Asks the kernel routing table for every route covering the target and
//! is healthy while at least one of them is more specific than a default
//! route, i.e. the IGP still carries a path to the target.

use super::HealthCheck;
use crate::config::HealthCheckSpec;
use crate::error::Result;
use crate::shell::{self, IP_CMD};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RouteCheck {
    name: String,
    target: IpAddr,
}

impl RouteCheck {
    pub fn new(name: impl Into<String>, target: IpAddr) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }

    pub fn from_spec(spec: &HealthCheckSpec) -> Self {
        Self::new(spec.name.clone(), spec.target)
    }

    pub fn command(&self) -> Vec<String> {
        let family = if self.target.is_ipv6() { "-6" } else { "-4" };
        vec![
            IP_CMD.to_string(),
            family.to_string(),
            "route".to_string(),
            "show".to_string(),
            "match".to_string(),
            self.target.to_string(),
        ]
    }
}

/// True if `ip route show` output lists a non-default route.
pub fn has_specific_route(output: &str) -> bool {
    output.lines().any(|line| {
        let mut fields = line.split_whitespace();
        // Route type keywords precede the destination.
        let mut destination = fields.next();
        if matches!(destination, Some("unicast" | "local")) {
            destination = fields.next();
        }
        match destination {
            None | Some("default") | Some("0.0.0.0/0") | Some("::/0") => false,
            Some("unreachable" | "blackhole" | "prohibit" | "throw") => false,
            Some(_) => true,
        }
    })
}

#[async_trait]
impl HealthCheck for RouteCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self, timeout: Duration) -> Result<bool> {
        let stdout = shell::exec_or_throw(&self.command(), timeout).await?;
        let healthy = has_specific_route(&stdout);
        if !healthy {
            debug!(check = %self.name, target = %self.target, "No specific route to target");
        }
        Ok(healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_route_command() {
        let check = RouteCheck::new("igp", "69::1".parse().unwrap());
        assert_eq!(
            check.command(),
            vec!["/sbin/ip", "-6", "route", "show", "match", "69::1"]
        );
        let check = RouteCheck::new("igp4", "10.0.0.1".parse().unwrap());
        assert_eq!(check.command()[1], "-4");
    }

    #[test]
    fn test_specific_route_detection() {
        let output = "default via 10.0.0.254 dev eth0 proto static\n\
                      10.0.0.0/24 via 10.1.1.1 dev eth1 proto ospf metric 20";
        assert!(has_specific_route(output));

        assert!(!has_specific_route("default via fe80::1 dev eth0 proto ra metric 1024"));
        assert!(!has_specific_route(""));
        assert!(!has_specific_route("unreachable 10.0.0.0/8 proto static"));
        assert!(has_specific_route("unicast 69::/64 dev eth0 proto kernel metric 256"));
    }
}
