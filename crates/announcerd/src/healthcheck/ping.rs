//! ICMP/ICMPv6 echo probe.
//!
//! Runs the system `ping`/`ping6` binary so the announcer itself needs no
//! raw socket privileges.

use super::HealthCheck;
use crate::config::HealthCheckSpec;
use crate::error::Result;
use crate::shell::{self, PING6_CMD, PING_CMD};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Healthy iff the target answers at least one echo request
#[derive(Debug, Clone)]
pub struct PingCheck {
    name: String,
    target: IpAddr,
    count: u32,
    wait: Duration,
}

impl PingCheck {
    pub fn new(name: impl Into<String>, target: IpAddr, count: u32, wait: Duration) -> Self {
        Self {
            name: name.into(),
            target,
            count,
            wait,
        }
    }

    pub fn from_spec(spec: &HealthCheckSpec) -> Self {
        Self::new(spec.name.clone(), spec.target, spec.ping_count, spec.ping_wait)
    }

    /// Argument vector for one probe.
    pub fn command(&self) -> Vec<String> {
        let program = if self.target.is_ipv6() {
            PING6_CMD
        } else {
            PING_CMD
        };
        vec![
            program.to_string(),
            "-c".to_string(),
            self.count.to_string(),
            "-w".to_string(),
            self.wait.as_secs().max(1).to_string(),
            self.target.to_string(),
        ]
    }
}

#[async_trait]
impl HealthCheck for PingCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self, timeout: Duration) -> Result<bool> {
        let result = shell::exec(&self.command(), timeout).await?;
        if !result.success() {
            debug!(
                check = %self.name,
                target = %self.target,
                exit_code = result.exit_code,
                "Ping failed"
            );
        }
        Ok(result.success())
    }
}
