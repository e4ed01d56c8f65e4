//! Prometheus metrics collection for announcerd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-6: Audit Record Review - Metrics available for analysis
//! - SI-4: System Monitoring - Probe, emission and FIB health metrics

use crate::healthcheck::Outcome;
use exabgp_api::CommandKind;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector shared by every announcer task
///
/// # NIST Controls
/// - SI-4: System Monitoring - Centralized metrics collection
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    pub probes_total: IntCounterVec,
    pub commands_emitted_total: IntCounterVec,
    pub emission_failures_total: IntCounter,
    pub events_decoded_total: IntCounter,
    pub decode_errors_total: IntCounter,
    pub fib_operations_total: IntCounterVec,
    pub fib_failures_total: IntCounter,

    // Gauges
    pub prefixes_up: IntGauge,
    pub learned_prefixes: IntGauge,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let probes_total = IntCounterVec::new(
            Opts::new("announcer_probes_total", "Health check probes by outcome"),
            &["check", "outcome"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let commands_emitted_total = IntCounterVec::new(
            Opts::new(
                "announcer_commands_emitted_total",
                "Commands delivered to the daemon by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(commands_emitted_total.clone()))?;

        let emission_failures_total = IntCounter::with_opts(Opts::new(
            "announcer_emission_failures_total",
            "Commands that could not be delivered to the daemon",
        ))?;
        registry.register(Box::new(emission_failures_total.clone()))?;

        let events_decoded_total = IntCounter::with_opts(Opts::new(
            "announcer_events_decoded_total",
            "Events decoded from the daemon",
        ))?;
        registry.register(Box::new(events_decoded_total.clone()))?;

        let decode_errors_total = IntCounter::with_opts(Opts::new(
            "announcer_decode_errors_total",
            "Inbound lines dropped as undecodable",
        ))?;
        registry.register(Box::new(decode_errors_total.clone()))?;

        let fib_operations_total = IntCounterVec::new(
            Opts::new(
                "announcer_fib_operations_total",
                "Learned-route FIB operations by handler and operation",
            ),
            &["fib", "operation"],
        )?;
        registry.register(Box::new(fib_operations_total.clone()))?;

        let fib_failures_total = IntCounter::with_opts(Opts::new(
            "announcer_fib_failures_total",
            "FIB operations that failed",
        ))?;
        registry.register(Box::new(fib_failures_total.clone()))?;

        let prefixes_up = IntGauge::with_opts(Opts::new(
            "announcer_prefixes_up",
            "Advertised prefixes currently Up",
        ))?;
        registry.register(Box::new(prefixes_up.clone()))?;

        let learned_prefixes = IntGauge::with_opts(Opts::new(
            "announcer_learned_prefixes",
            "Prefixes currently held in the learned-route table",
        ))?;
        registry.register(Box::new(learned_prefixes.clone()))?;

        Ok(Self {
            probes_total,
            commands_emitted_total,
            emission_failures_total,
            events_decoded_total,
            decode_errors_total,
            fib_operations_total,
            fib_failures_total,
            prefixes_up,
            learned_prefixes,
            registry: Arc::new(registry),
        })
    }

    pub fn record_probe(&self, check: &str, outcome: Outcome) {
        self.probes_total
            .with_label_values(&[check, outcome.as_str()])
            .inc();
    }

    pub fn record_command(&self, kind: CommandKind) {
        let label = match kind {
            CommandKind::Announce => "announce",
            CommandKind::Withdraw => "withdraw",
        };
        self.commands_emitted_total.with_label_values(&[label]).inc();
    }

    pub fn record_emission_failure(&self) {
        self.emission_failures_total.inc();
    }

    pub fn record_event(&self) {
        self.events_decoded_total.inc();
    }

    pub fn record_decode_error(&self) {
        self.decode_errors_total.inc();
    }

    pub fn record_fib_operation(&self, fib: &str, operation: &str, ok: bool) {
        self.fib_operations_total
            .with_label_values(&[fib, operation])
            .inc();
        if !ok {
            self.fib_failures_total.inc();
        }
    }

    /// Track an Up/Down transition. `up` is the new status.
    pub fn record_transition(&self, up: bool) {
        if up {
            self.prefixes_up.inc();
        } else {
            self.prefixes_up.dec();
        }
    }

    pub fn set_learned_prefixes(&self, count: usize) {
        self.learned_prefixes.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
