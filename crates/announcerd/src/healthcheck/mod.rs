//! Health checks
//!
//! A health check is anything implementing [`HealthCheck`]. The scheduler
//! only ever calls [`run_probe`], which enforces the probe timeout and turns
//! every fault (error return, timeout, panic) into [`Outcome::Error`].
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-4: System Monitoring - Periodic reachability probes
//! - SI-11: Error Handling - Probe faults never reach the scheduler

pub mod ping;
pub mod route;

pub use ping::PingCheck;
pub use route::RouteCheck;

use crate::config::{CheckKind, HealthCheckSpec};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Outcome of one probe cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Healthy,
    Unhealthy,
    /// Probe failed to run or timed out; counted like `Unhealthy`
    Error,
}

impl Outcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Outcome::Healthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Healthy => "healthy",
            Outcome::Unhealthy => "unhealthy",
            Outcome::Error => "error",
        }
    }
}

/// Result of a single probe, consumed by every bound route state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub check: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
}

impl HealthCheckResult {
    pub fn new(check: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            check: check.into(),
            timestamp: Utc::now(),
            outcome,
        }
    }
}

/// A probe of some upstream resource
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Run one probe. `Ok(false)` is unhealthy; `Err` is a probe fault.
    async fn probe(&self, timeout: Duration) -> Result<bool>;
}

/// Run one probe cycle under `timeout`.
pub async fn run_probe(check: &dyn HealthCheck, timeout: Duration) -> HealthCheckResult {
    let probe = AssertUnwindSafe(check.probe(timeout)).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(Ok(true))) => Outcome::Healthy,
        Ok(Ok(Ok(false))) => Outcome::Unhealthy,
        Ok(Ok(Err(e))) => {
            warn!(check = %check.name(), error = %e, "Probe fault");
            Outcome::Error
        }
        Ok(Err(_)) => {
            warn!(check = %check.name(), "Probe panicked");
            Outcome::Error
        }
        Err(_) => {
            warn!(check = %check.name(), timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "Probe timed out");
            Outcome::Error
        }
    };
    HealthCheckResult::new(check.name(), outcome)
}

/// Build the probe for a configured check.
pub fn from_spec(spec: &HealthCheckSpec) -> Arc<dyn HealthCheck> {
    match spec.kind {
        CheckKind::Ping => Arc::new(PingCheck::from_spec(spec)),
        CheckKind::Route => Arc::new(RouteCheck::from_spec(spec)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnnouncerError;
    use pretty_assertions::assert_eq;

    enum Behaviour {
        Answer(bool),
        Fail,
        Hang,
        Panic,
    }

    struct Scripted(Behaviour);

    #[async_trait]
    impl HealthCheck for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn probe(&self, _timeout: Duration) -> Result<bool> {
            match self.0 {
                Behaviour::Answer(healthy) => Ok(healthy),
                Behaviour::Fail => Err(AnnouncerError::Shell {
                    command: "ping".to_string(),
                    reason: "spawn failed".to_string(),
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(true)
                }
                Behaviour::Panic => panic!("probe bug"),
            }
        }
    }

    async fn outcome(behaviour: Behaviour) -> Outcome {
        run_probe(&Scripted(behaviour), Duration::from_millis(50))
            .await
            .outcome
    }

    #[tokio::test]
    async fn test_answers_map_to_outcomes() {
        assert_eq!(outcome(Behaviour::Answer(true)).await, Outcome::Healthy);
        assert_eq!(outcome(Behaviour::Answer(false)).await, Outcome::Unhealthy);
    }

    #[tokio::test]
    async fn test_faults_are_errors() {
        assert_eq!(outcome(Behaviour::Fail).await, Outcome::Error);
        assert_eq!(outcome(Behaviour::Panic).await, Outcome::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_error() {
        assert_eq!(outcome(Behaviour::Hang).await, Outcome::Error);
    }

    #[test]
    fn test_result_carries_check_name() {
        let result = HealthCheckResult::new("upstream", Outcome::Unhealthy);
        assert_eq!(result.check, "upstream");
        assert!(!result.outcome.is_healthy());
        assert_eq!(result.outcome.as_str(), "unhealthy");
    }

    #[test]
    fn test_from_spec_picks_variant() {
        let spec = HealthCheckSpec {
            name: "igp".to_string(),
            kind: CheckKind::Route,
            target: "10.0.0.1".parse().unwrap(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 1,
            success_threshold: 1,
            ping_count: 2,
            ping_wait: Duration::from_secs(1),
        };
        assert_eq!(from_spec(&spec).name(), "igp");
    }
}
