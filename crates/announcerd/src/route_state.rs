//! Per-prefix route state machine
//!
//! Combines the results of every health check bound to one prefix into a
//! single Up/Down decision:
//!
//! - `Up -> Down` as soon as any bound check reaches its failure threshold.
//! - `Down -> Up` only when every bound check has reached its success
//!   threshold at the same time.
//! - A prefix with no bound checks is always Up.
//!
//! A command is produced only when the decided status differs from what
//! was last delivered to the daemon. Delivery is confirmed with
//! [`RouteState::commit`]; an uncommitted command is produced again on the
//! next result.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Routes advertised only while upstream is healthy
//! - SI-4: System Monitoring - Threshold-based failure detection

use crate::healthcheck::HealthCheckResult;
use exabgp_api::{Command, CommandKind, RouteAttributes};
use exabgp_types::IpPrefix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Status assumed before any probe has reported
///
/// `WithdrawFirst` starts every checked prefix Down and withdraws it at
/// startup, clearing stale routes the daemon may still hold.
/// `AnnounceFirst` starts Up and announces immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosture {
    #[default]
    WithdrawFirst,
    AnnounceFirst,
}

/// Aggregate status of a prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteStatus {
    Up,
    Down,
}

impl RouteStatus {
    fn command_kind(self) -> CommandKind {
        match self {
            RouteStatus::Up => CommandKind::Announce,
            RouteStatus::Down => CommandKind::Withdraw,
        }
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteStatus::Up => f.write_str("up"),
            RouteStatus::Down => f.write_str("down"),
        }
    }
}

/// Streak thresholds of one bound check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub failure: u32,
    pub success: u32,
}

#[derive(Debug, Clone)]
struct CheckCounters {
    thresholds: Thresholds,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl CheckCounters {
    fn failed(&self) -> bool {
        self.consecutive_failures >= self.thresholds.failure
    }

    fn recovered(&self) -> bool {
        self.consecutive_successes >= self.thresholds.success
    }
}

/// State of one advertised prefix
#[derive(Debug, Clone)]
pub struct RouteState {
    prefix: IpPrefix,
    attributes: RouteAttributes,
    checks: BTreeMap<String, CheckCounters>,
    status: RouteStatus,
    last_emitted: Option<CommandKind>,
}

impl RouteState {
    pub fn new(
        prefix: IpPrefix,
        attributes: RouteAttributes,
        checks: impl IntoIterator<Item = (String, Thresholds)>,
        posture: InitialPosture,
    ) -> Self {
        let checks: BTreeMap<String, CheckCounters> = checks
            .into_iter()
            .map(|(name, thresholds)| {
                (
                    name,
                    CheckCounters {
                        thresholds,
                        consecutive_failures: 0,
                        consecutive_successes: 0,
                    },
                )
            })
            .collect();

        let status = if checks.is_empty() {
            RouteStatus::Up
        } else {
            match posture {
                InitialPosture::WithdrawFirst => RouteStatus::Down,
                InitialPosture::AnnounceFirst => RouteStatus::Up,
            }
        };

        Self {
            prefix,
            attributes,
            checks,
            status,
            last_emitted: None,
        }
    }

    pub fn prefix(&self) -> &IpPrefix {
        &self.prefix
    }

    pub fn status(&self) -> RouteStatus {
        self.status
    }

    /// Kind of the last command the daemon accepted for this prefix
    pub fn last_emitted(&self) -> Option<CommandKind> {
        self.last_emitted
    }

    pub fn bound_checks(&self) -> impl Iterator<Item = &str> {
        self.checks.keys().map(String::as_str)
    }

    /// Command announcing the startup posture, until one is committed.
    pub fn initial_command(&self) -> Option<Command> {
        match self.last_emitted {
            None => Some(self.command_for(self.status)),
            Some(_) => None,
        }
    }

    /// Apply one probe result.
    ///
    /// Returns the command to emit, if the decided status differs from the
    /// last one delivered.
    pub fn record(&mut self, result: &HealthCheckResult) -> Option<Command> {
        let Some(counters) = self.checks.get_mut(&result.check) else {
            warn!(prefix = %self.prefix, check = %result.check, "Result for unbound check ignored");
            return None;
        };

        if result.outcome.is_healthy() {
            counters.consecutive_successes = counters.consecutive_successes.saturating_add(1);
            counters.consecutive_failures = 0;
        } else {
            counters.consecutive_failures = counters.consecutive_failures.saturating_add(1);
            counters.consecutive_successes = 0;
        }

        let next = self.evaluate();
        if next != self.status {
            debug!(
                prefix = %self.prefix,
                check = %result.check,
                from = %self.status,
                to = %next,
                "Route status changed"
            );
            self.status = next;
        }

        if self.last_emitted == Some(self.status.command_kind()) {
            return None;
        }
        Some(self.command_for(self.status))
    }

    /// Mark a command as delivered to the daemon.
    ///
    /// Neighbor-scoped commands do not change what the daemon advertises
    /// globally and are not recorded.
    pub fn commit(&mut self, command: &Command) {
        if matches!(command, Command::Neighbor { .. }) {
            return;
        }
        self.last_emitted = Some(command.kind());
    }

    /// Withdraw to send at shutdown, if the prefix may be advertised.
    pub fn shutdown_command(&self) -> Option<Command> {
        if self.status == RouteStatus::Up || self.last_emitted == Some(CommandKind::Announce) {
            Some(self.command_for(RouteStatus::Down))
        } else {
            None
        }
    }

    /// Announce scoped to a newly established peer, if currently advertised.
    pub fn reannounce_command(&self, peer: IpAddr) -> Option<Command> {
        if self.status == RouteStatus::Up && self.last_emitted == Some(CommandKind::Announce) {
            Some(self.command_for(RouteStatus::Up).for_neighbor(peer))
        } else {
            None
        }
    }

    fn evaluate(&self) -> RouteStatus {
        if self.checks.is_empty() {
            return RouteStatus::Up;
        }
        if self.checks.values().any(CheckCounters::failed) {
            return RouteStatus::Down;
        }
        match self.status {
            RouteStatus::Up => RouteStatus::Up,
            RouteStatus::Down if self.checks.values().all(CheckCounters::recovered) => {
                RouteStatus::Up
            }
            RouteStatus::Down => RouteStatus::Down,
        }
    }

    fn command_for(&self, status: RouteStatus) -> Command {
        match status {
            RouteStatus::Up => Command::announce(self.prefix, self.attributes.clone()),
            RouteStatus::Down => Command::withdraw(self.prefix, self.attributes.next_hop),
        }
    }
}
