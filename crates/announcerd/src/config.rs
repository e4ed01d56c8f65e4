//! Configuration file support for announcerd
//!
//! Loads and validates announcer configuration from TOML files, or JSON
//! files when the path ends in `.json`.
//! Default location: /etc/exabgp/announcer.toml
//!
//! ```toml
//! [advertise]
//! next_hop = "self"
//! initial_posture = "withdraw_first"
//!
//! [[advertise.prefixes]]
//! prefix = "69::/32"
//! checks = ["upstream"]
//!
//! [[healthchecks]]
//! name = "upstream"
//! kind = "ping"
//! target = "69::1"
//!
//! [learn]
//! fibs = ["linux"]
//! ```
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - CM-6: Configuration Settings - Validated before any probe is scheduled
//! - SI-10: Information Input Validation - Prefixes, next hops and attributes

use crate::error::{AnnouncerError, Result};
use crate::route_state::InitialPosture;
use exabgp_api::{Origin, RouteAttributes};
use exabgp_types::{IpPrefix, NextHop};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/exabgp/announcer.toml";

/// FIB handler names this daemon can program
pub const KNOWN_FIBS: [&str; 1] = ["linux"];

/// Advertisement configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertiseConfig {
    /// Next hop used for every prefix without an override
    #[serde(default)]
    pub next_hop: NextHop,

    /// Command emitted for each prefix before any probe has reported
    #[serde(default)]
    pub initial_posture: InitialPosture,

    /// Timeout for writing one command to the daemon, in milliseconds
    #[serde(default = "default_emit_timeout")]
    pub emit_timeout_ms: u64,

    /// Prefixes to advertise
    #[serde(default)]
    pub prefixes: Vec<PrefixConfig>,
}

/// One advertised prefix and the checks guarding it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixConfig {
    pub prefix: IpPrefix,

    /// Names of the health checks bound to this prefix
    #[serde(default)]
    pub checks: Vec<String>,

    #[serde(default)]
    pub attributes: AttributeConfig,
}

/// Path attributes configured for a prefix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    /// Overrides `advertise.next_hop`
    pub next_hop: Option<NextHop>,
    pub origin: Option<Origin>,
    pub local_preference: Option<u32>,
    pub med: Option<u32>,
    pub communities: Vec<String>,
    pub as_path: Vec<u32>,
}

/// Probe mechanism of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// ICMP echo via ping/ping6
    #[default]
    Ping,
    /// Presence of a route to the target in the kernel routing table
    Route,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub name: String,

    #[serde(default)]
    pub kind: CheckKind,

    /// Address probed by the check
    pub target: IpAddr,

    /// Seconds between probe cycles
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Seconds before a probe is abandoned and counted as an error
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failed probes before the check is considered failed
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive healthy probes before a failed check recovers
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Echo requests per ping probe
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,

    /// Ping deadline in seconds; defaults to one second less than the timeout
    #[serde(default)]
    pub ping_wait_secs: Option<u64>,
}

/// Learned-route (FIB) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnConfig {
    /// FIB handlers to program learned routes into
    #[serde(default)]
    pub fibs: Vec<String>,

    /// Install learned default routes
    #[serde(default)]
    pub allow_default: bool,

    /// Accept link-local next hops
    #[serde(default)]
    pub allow_link_local_next_hop: bool,

    /// Maximum learned prefixes; 0 is unlimited
    #[serde(default)]
    pub prefix_limit: usize,

    /// Prefix route programming commands with sudo
    #[serde(default)]
    pub use_sudo: bool,

    /// Metric of routes installed into the kernel
    #[serde(default = "default_route_metric")]
    pub route_metric: u32,
}

/// Control channel location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// FIFO the daemon reads commands from; stdout when unset
    #[serde(default)]
    pub in_pipe: Option<PathBuf>,

    /// FIFO the daemon writes events to; stdin when unset
    #[serde(default)]
    pub out_pipe: Option<PathBuf>,
}

/// Complete announcerd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnouncerConfig {
    #[serde(default)]
    pub advertise: AdvertiseConfig,

    #[serde(default)]
    pub healthchecks: Vec<HealthCheckConfig>,

    #[serde(default)]
    pub learn: LearnConfig,

    #[serde(default)]
    pub channel: ChannelConfig,
}

// Default functions
fn default_emit_timeout() -> u64 {
    5000
}

fn default_interval() -> u64 {
    5
}

fn default_timeout() -> u64 {
    4
}

fn default_failure_threshold() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    1
}

fn default_ping_count() -> u32 {
    2
}

fn default_route_metric() -> u32 {
    31337
}

// Default implementations
impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            next_hop: NextHop::default(),
            initial_posture: InitialPosture::default(),
            emit_timeout_ms: default_emit_timeout(),
            prefixes: Vec::new(),
        }
    }
}

impl Default for LearnConfig {
    fn default() -> Self {
        Self {
            fibs: Vec::new(),
            allow_default: false,
            allow_link_local_next_hop: false,
            prefix_limit: 0,
            use_sudo: false,
            route_metric: default_route_metric(),
        }
    }
}

/// Immutable health check definition handed to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub name: String,
    pub kind: CheckKind,
    pub target: IpAddr,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub ping_count: u32,
    pub ping_wait: Duration,
}

/// Immutable advertised prefix definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixSpec {
    pub prefix: IpPrefix,
    pub checks: Vec<String>,
    pub attributes: RouteAttributes,
}

impl AnnouncerConfig {
    /// Load configuration from file.
    ///
    /// Unlike most daemons a missing file is an error: without prefixes
    /// there is nothing to announce.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AnnouncerError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        parsed.map_err(|e| {
            AnnouncerError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AnnouncerError::Config(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| AnnouncerError::Config(e.to_string()))
    }

    /// Write timeout for the command channel
    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.advertise.emit_timeout_ms)
    }

    /// Validate configuration
    ///
    /// # NIST Controls
    /// - CM-6: Configuration Settings - Reject inconsistent configuration at startup
    pub fn validate(&self) -> Result<()> {
        if self.advertise.emit_timeout_ms == 0 {
            return Err(AnnouncerError::Config(
                "advertise.emit_timeout_ms must be > 0".to_string(),
            ));
        }

        let mut check_names = HashSet::new();
        for check in &self.healthchecks {
            if check.name.trim().is_empty() {
                return Err(AnnouncerError::Config(
                    "healthcheck name must not be empty".to_string(),
                ));
            }
            if !check_names.insert(check.name.as_str()) {
                return Err(AnnouncerError::Config(format!(
                    "duplicate healthcheck name {:?}",
                    check.name
                )));
            }
            for (field, value) in [
                ("interval_secs", check.interval_secs),
                ("timeout_secs", check.timeout_secs),
                ("failure_threshold", u64::from(check.failure_threshold)),
                ("success_threshold", u64::from(check.success_threshold)),
                ("ping_count", u64::from(check.ping_count)),
            ] {
                if value == 0 {
                    return Err(AnnouncerError::Config(format!(
                        "healthcheck {:?}: {} must be > 0",
                        check.name, field
                    )));
                }
            }
            if check.ping_wait_secs == Some(0) {
                return Err(AnnouncerError::Config(format!(
                    "healthcheck {:?}: ping_wait_secs must be > 0",
                    check.name
                )));
            }
            if check.timeout_secs >= check.interval_secs {
                warn!(
                    check = %check.name,
                    timeout_secs = check.timeout_secs,
                    interval_secs = check.interval_secs,
                    "Health check timeout is not shorter than its interval"
                );
            }
        }

        let mut prefixes = HashSet::new();
        for prefix in &self.advertise.prefixes {
            if !prefixes.insert(prefix.prefix) {
                return Err(AnnouncerError::Config(format!(
                    "duplicate advertised prefix {}",
                    prefix.prefix
                )));
            }
            let mut bound = HashSet::new();
            for name in &prefix.checks {
                if !check_names.contains(name.as_str()) {
                    return Err(AnnouncerError::Config(format!(
                        "prefix {} references unknown healthcheck {:?}",
                        prefix.prefix, name
                    )));
                }
                if !bound.insert(name.as_str()) {
                    return Err(AnnouncerError::Config(format!(
                        "prefix {} binds healthcheck {:?} twice",
                        prefix.prefix, name
                    )));
                }
            }
            self.route_attributes(prefix)
                .validate()
                .map_err(|e| AnnouncerError::Config(format!("prefix {}: {}", prefix.prefix, e)))?;
        }

        for fib in &self.learn.fibs {
            if !KNOWN_FIBS.contains(&fib.as_str()) {
                return Err(AnnouncerError::Config(format!(
                    "unknown FIB {:?} (known: {})",
                    fib,
                    KNOWN_FIBS.join(", ")
                )));
            }
        }

        if self.channel.in_pipe.is_some() != self.channel.out_pipe.is_some() {
            return Err(AnnouncerError::Config(
                "channel.in_pipe and channel.out_pipe must be set together".to_string(),
            ));
        }

        Ok(())
    }

    /// Immutable health check definitions, in configuration order
    pub fn healthcheck_specs(&self) -> Vec<HealthCheckSpec> {
        self.healthchecks
            .iter()
            .map(|check| {
                let wait = check
                    .ping_wait_secs
                    .unwrap_or_else(|| check.timeout_secs.saturating_sub(1).max(1));
                HealthCheckSpec {
                    name: check.name.clone(),
                    kind: check.kind,
                    target: check.target,
                    interval: Duration::from_secs(check.interval_secs),
                    timeout: Duration::from_secs(check.timeout_secs),
                    failure_threshold: check.failure_threshold,
                    success_threshold: check.success_threshold,
                    ping_count: check.ping_count,
                    ping_wait: Duration::from_secs(wait),
                }
            })
            .collect()
    }

    /// Immutable prefix definitions, in configuration order
    pub fn prefix_specs(&self) -> Vec<PrefixSpec> {
        self.advertise
            .prefixes
            .iter()
            .map(|prefix| PrefixSpec {
                prefix: prefix.prefix,
                checks: prefix.checks.clone(),
                attributes: self.route_attributes(prefix),
            })
            .collect()
    }

    /// Every advertised prefix
    pub fn advertised_prefixes(&self) -> Vec<IpPrefix> {
        self.advertise.prefixes.iter().map(|p| p.prefix).collect()
    }

    fn route_attributes(&self, prefix: &PrefixConfig) -> RouteAttributes {
        let attributes = &prefix.attributes;
        RouteAttributes {
            next_hop: attributes.next_hop.unwrap_or(self.advertise.next_hop),
            origin: attributes.origin,
            local_preference: attributes.local_preference,
            med: attributes.med,
            communities: attributes.communities.clone(),
            as_path: attributes.as_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
[advertise]
next_hop = "2000:69::1"
initial_posture = "announce_first"

[[advertise.prefixes]]
prefix = "69::/32"
checks = ["upstream", "igp"]

[advertise.prefixes.attributes]
med = 10
communities = ["65000:1"]

[[advertise.prefixes]]
prefix = "10.69.0.0/16"
checks = ["upstream"]

[advertise.prefixes.attributes]
next_hop = "sELf"

[[healthchecks]]
name = "upstream"
target = "69::1"
failure_threshold = 3
success_threshold = 2

[[healthchecks]]
name = "igp"
kind = "route"
target = "10.0.0.1"
interval_secs = 10

[learn]
fibs = ["linux"]
prefix_limit = 100
"#;

    fn sample() -> AnnouncerConfig {
        AnnouncerConfig::from_toml_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();
        config.validate().unwrap();

        assert_eq!(config.advertise.initial_posture, InitialPosture::AnnounceFirst);
        assert_eq!(config.advertise.emit_timeout_ms, 5000);
        assert_eq!(config.healthchecks[0].kind, CheckKind::Ping);
        assert_eq!(config.healthchecks[1].kind, CheckKind::Route);
        assert_eq!(config.learn.route_metric, 31337);
        assert_eq!(config.learn.prefix_limit, 100);
        assert!(config.channel.in_pipe.is_none());
    }

    #[test]
    fn test_prefix_specs_resolve_next_hop() {
        let specs = sample().prefix_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].attributes.next_hop.to_string(), "2000:69::1");
        assert_eq!(specs[0].attributes.med, Some(10));
        assert_eq!(specs[0].checks, vec!["upstream", "igp"]);
        assert_eq!(specs[1].attributes.next_hop, NextHop::SelfAddress);
    }

    #[test]
    fn test_healthcheck_specs_defaults() {
        let specs = sample().healthcheck_specs();
        assert_eq!(specs[0].interval, Duration::from_secs(5));
        assert_eq!(specs[0].timeout, Duration::from_secs(4));
        assert_eq!(specs[0].ping_wait, Duration::from_secs(3));
        assert_eq!(specs[0].ping_count, 2);
        assert_eq!(specs[0].failure_threshold, 3);
        assert_eq!(specs[1].interval, Duration::from_secs(10));
        assert_eq!(specs[1].failure_threshold, 1);
    }

    #[test]
    fn test_default_timeout_shorter_than_interval() {
        let config = AnnouncerConfig::from_toml_str(
            r#"
[advertise]
prefixes = [{ prefix = "69::/32", checks = ["upstream"] }]

[[healthchecks]]
name = "upstream"
kind = "ping"
target = "2000:69::2"
"#,
        )
        .unwrap();
        config.validate().unwrap();

        let spec = &config.healthcheck_specs()[0];
        assert!(spec.timeout < spec.interval);
        assert!(spec.ping_wait < spec.timeout);
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let mut config = sample();
        let dup = config.advertise.prefixes[0].clone();
        config.advertise.prefixes.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate advertised prefix 69::/32"));
        assert_eq!(err.exit_code(), 69);
    }

    #[test]
    fn test_duplicate_check_rejected() {
        let mut config = sample();
        let dup = config.healthchecks[0].clone();
        config.healthchecks.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_check_rejected() {
        let mut config = sample();
        config.advertise.prefixes[1].checks.push("missing".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown healthcheck \"missing\""));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = sample();
        config.healthchecks[1].success_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fib_rejected() {
        let mut config = sample();
        config.learn.fibs.push("bird".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_next_hop_rejected() {
        let toml = SAMPLE.replace("2000:69::1", "cooper69");
        assert!(AnnouncerConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_bad_community_rejected() {
        let mut config = sample();
        config.advertise.prefixes[0]
            .attributes
            .communities
            .push("65000:1 withdraw".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_half_configured_channel_rejected() {
        let mut config = sample();
        config.channel.in_pipe = Some(PathBuf::from("/run/exabgp/exabgp.in"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{
                "advertise": {{"prefixes": [{{"prefix": "69::/32", "checks": ["ping"]}}]}},
                "healthchecks": [{{"name": "ping", "target": "69::1"}}],
                "learn": {{"fibs": [], "allow_default": true}}
            }}"#
        )
        .unwrap();

        let config = AnnouncerConfig::load(file.path()).unwrap();
        config.validate().unwrap();
        assert!(config.learn.allow_default);
        assert_eq!(
            config.advertised_prefixes(),
            vec!["69::/32".parse::<IpPrefix>().unwrap()]
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = AnnouncerConfig::load("/nonexistent/announcer.toml").unwrap_err();
        assert!(matches!(err, AnnouncerError::Config(_)));
    }
}
