//! Linux kernel routing table FIB, programmed through iproute2.

use super::FibHandler;
use crate::config::LearnConfig;
use crate::error::{AnnouncerError, Result};
use crate::shell::{self, IP_CMD, SUDO_CMD};
use async_trait::async_trait;
use exabgp_api::FibPrefix;
use exabgp_types::is_link_local;
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

/// Timeout for one `ip route` invocation
pub const ROUTE_CMD_TIMEOUT: Duration = Duration::from_secs(2);

const FIB_NAME: &str = "linux";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Add,
    Delete,
}

impl RouteAction {
    fn as_str(self) -> &'static str {
        match self {
            RouteAction::Add => "add",
            RouteAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinuxFib {
    use_sudo: bool,
    metric: u32,
    allow_link_local_next_hop: bool,
    timeout: Duration,
}

impl LinuxFib {
    pub fn new(use_sudo: bool, metric: u32, allow_link_local_next_hop: bool) -> Self {
        Self {
            use_sudo,
            metric,
            allow_link_local_next_hop,
            timeout: ROUTE_CMD_TIMEOUT,
        }
    }

    pub fn from_config(learn: &LearnConfig) -> Self {
        Self::new(
            learn.use_sudo,
            learn.route_metric,
            learn.allow_link_local_next_hop,
        )
    }

    /// Argument vector programming `route`.
    ///
    /// # Errors
    ///
    /// Rejects link-local next hops unless allowed, and IPv6 prefixes with
    /// an IPv4 next hop.
    pub fn command(&self, route: &FibPrefix, action: RouteAction) -> Result<Vec<String>> {
        let next_hop = route.next_hop;
        if !self.allow_link_local_next_hop && is_link_local(&next_hop) {
            return Err(AnnouncerError::fib(
                FIB_NAME,
                format!("link-local next hop {} for {} not allowed", next_hop, route.prefix),
            ));
        }
        if route.prefix.is_ipv6() && next_hop.is_ipv4() {
            return Err(AnnouncerError::fib(
                FIB_NAME,
                format!("IPv6 prefix {} via IPv4 next hop {}", route.prefix, next_hop),
            ));
        }

        let mut argv = Vec::with_capacity(12);
        if self.use_sudo {
            argv.push(SUDO_CMD.to_string());
        }
        argv.push(IP_CMD.to_string());
        argv.push(format!("-{}", route.prefix.version()));
        argv.push("route".to_string());
        argv.push(action.as_str().to_string());
        argv.push(if route.prefix.is_default() {
            "default".to_string()
        } else {
            route.prefix.to_string()
        });
        argv.push("via".to_string());
        if route.prefix.is_ipv4() && matches!(next_hop, IpAddr::V6(_)) {
            argv.push("inet6".to_string());
        }
        argv.push(next_hop.to_string());
        argv.push("metric".to_string());
        argv.push(self.metric.to_string());
        Ok(argv)
    }

    async fn run(&self, route: &FibPrefix, action: RouteAction) -> Result<()> {
        let argv = self.command(route, action)?;
        info!(
            prefix = %route.prefix,
            next_hop = %route.next_hop,
            action = action.as_str(),
            "Programming kernel route"
        );
        shell::exec_or_throw(&argv, self.timeout)
            .await
            .map(|_| ())
            .map_err(|e| AnnouncerError::fib(FIB_NAME, e.to_string()))
    }
}

#[async_trait]
impl FibHandler for LinuxFib {
    fn name(&self) -> &str {
        FIB_NAME
    }

    async fn apply_route(&self, route: &FibPrefix) -> Result<()> {
        self.run(route, RouteAction::Add).await
    }

    async fn remove_route(&self, route: &FibPrefix) -> Result<()> {
        self.run(route, RouteAction::Delete).await
    }
}
