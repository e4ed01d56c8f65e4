//! Announcer orchestrator
//!
//! Task layout:
//!
//! ```text
//! check task (1 per check) ──HealthCheckResult──> prefix owner (1 per prefix) ──Command──> CommandWriter
//! decode_loop ──Decoded──> learn task ──FibPrefix──> FibConsumer
//!                              └──PeerUp──> prefix owners
//! ```
//!
//! Each prefix owner is the only holder of its [`RouteState`] and awaits
//! every emission before taking the next input, so transitions for one
//! prefix are written in the order they were decided.
//!
//! Shutdown: check tasks finish their current cycle and stop, the learn
//! side stops, owners drain their queues and hand back their state, then
//! every prefix that may be advertised is withdrawn before the command
//! channel is closed.
//!
//! Losing the command channel stops the run: an owner whose write fails
//! and leaves the writer closed cancels every task, and `run` returns the
//! write error. Nothing can be withdrawn once commands no longer reach
//! the daemon, so the supervisor has to restart the process.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Routes withdrawn when upstream health is lost
//! - SI-4: System Monitoring - Continuous concurrent probing
//! - CP-10: System Recovery - Withdraw sweep on every shutdown path

use crate::config::{AnnouncerConfig, HealthCheckSpec, PrefixSpec};
use crate::error::{AnnouncerError, Result};
use crate::fib::{remove_internal_networks, FibConsumer};
use crate::healthcheck::{self, run_probe, HealthCheck, HealthCheckResult};
use crate::metrics::MetricsCollector;
use crate::route_state::{InitialPosture, RouteState, RouteStatus, Thresholds};
use exabgp_api::{
    decode_loop, Ack, ApiError, Command, CommandKind, CommandWriter, Decoded, Direction, Event,
    EventReader, PeerState,
};
use exabgp_types::IpPrefix;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Queue depth of each prefix owner
const PREFIX_QUEUE_DEPTH: usize = 64;

/// Queue depth between the decoder and the learn task
const EVENT_QUEUE_DEPTH: usize = 256;

/// A configured check together with its probe implementation
#[derive(Clone)]
pub struct ScheduledCheck {
    pub spec: HealthCheckSpec,
    pub check: Arc<dyn HealthCheck>,
}

impl ScheduledCheck {
    pub fn new(spec: HealthCheckSpec, check: Arc<dyn HealthCheck>) -> Self {
        Self { spec, check }
    }

    pub fn from_spec(spec: HealthCheckSpec) -> Self {
        let check = healthcheck::from_spec(&spec);
        Self { spec, check }
    }
}

/// Input to a prefix owner
#[derive(Debug, Clone)]
enum PrefixInput {
    Result(HealthCheckResult),
    /// A BGP session came up; re-send current announcements to it
    PeerUp(IpAddr),
}

/// Outcome of the shutdown sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub withdrawn: usize,
    pub failed: usize,
}

struct Learning {
    consumer: Option<FibConsumer>,
    allow_default: bool,
}

pub struct Announcer {
    prefixes: Vec<PrefixSpec>,
    checks: Vec<ScheduledCheck>,
    posture: InitialPosture,
    writer: CommandWriter,
    metrics: MetricsCollector,
    learning: Learning,
}

impl Announcer {
    /// # Errors
    ///
    /// Fails on duplicate prefixes or checks and on bindings to unknown checks.
    pub fn new(
        prefixes: Vec<PrefixSpec>,
        checks: Vec<ScheduledCheck>,
        posture: InitialPosture,
        writer: CommandWriter,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let mut names = HashSet::new();
        for check in &checks {
            if !names.insert(check.spec.name.as_str()) {
                return Err(AnnouncerError::Config(format!(
                    "duplicate healthcheck name {:?}",
                    check.spec.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for prefix in &prefixes {
            if !seen.insert(prefix.prefix) {
                return Err(AnnouncerError::Config(format!(
                    "duplicate advertised prefix {}",
                    prefix.prefix
                )));
            }
            if let Some(unknown) = prefix.checks.iter().find(|c| !names.contains(c.as_str())) {
                return Err(AnnouncerError::Config(format!(
                    "prefix {} references unknown healthcheck {:?}",
                    prefix.prefix, unknown
                )));
            }
        }

        Ok(Self {
            prefixes,
            checks,
            posture,
            writer,
            metrics,
            learning: Learning {
                consumer: None,
                allow_default: false,
            },
        })
    }

    /// Build from validated configuration with the real probe implementations.
    pub fn from_config(
        config: &AnnouncerConfig,
        writer: CommandWriter,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let checks = config
            .healthcheck_specs()
            .into_iter()
            .map(ScheduledCheck::from_spec)
            .collect();
        let mut announcer = Self::new(
            config.prefix_specs(),
            checks,
            config.advertise.initial_posture,
            writer,
            metrics,
        )?;
        announcer.learning.allow_default = config.learn.allow_default;
        Ok(announcer)
    }

    /// Forward learned routes to `consumer`.
    pub fn with_fib_consumer(mut self, consumer: FibConsumer, allow_default: bool) -> Self {
        self.learning = Learning {
            consumer: Some(consumer),
            allow_default,
        };
        self
    }

    pub fn advertised_prefixes(&self) -> Vec<IpPrefix> {
        self.prefixes.iter().map(|p| p.prefix).collect()
    }

    /// Run until `cancel` fires or either channel is lost.
    ///
    /// The withdraw sweep and channel close happen on every path. An event
    /// channel EOF or a failed command write is returned as an error after
    /// the sweep.
    #[instrument(skip_all, fields(prefixes = self.prefixes.len(), checks = self.checks.len()))]
    pub async fn run(
        self,
        events: Option<EventReader>,
        cancel: CancellationToken,
    ) -> Result<ShutdownReport> {
        let Announcer {
            prefixes,
            checks,
            posture,
            writer,
            metrics,
            learning,
        } = self;
        let stop = cancel.child_token();

        let thresholds: HashMap<String, Thresholds> = checks
            .iter()
            .map(|c| {
                (
                    c.spec.name.clone(),
                    Thresholds {
                        failure: c.spec.failure_threshold,
                        success: c.spec.success_threshold,
                    },
                )
            })
            .collect();

        // One owner per prefix.
        let mut owner_senders = Vec::with_capacity(prefixes.len());
        let mut owners: Vec<JoinHandle<OwnerExit>> = Vec::with_capacity(prefixes.len());
        let mut targets: HashMap<String, Vec<mpsc::Sender<PrefixInput>>> = HashMap::new();
        let advertised: Vec<IpPrefix> = prefixes.iter().map(|p| p.prefix).collect();

        for spec in prefixes {
            let bound = spec
                .checks
                .iter()
                .filter_map(|name| thresholds.get(name.as_str()).map(|t| (name.clone(), *t)));
            let state = RouteState::new(spec.prefix, spec.attributes.clone(), bound, posture);
            let (tx, rx) = mpsc::channel(PREFIX_QUEUE_DEPTH);
            for name in &spec.checks {
                targets.entry(name.clone()).or_default().push(tx.clone());
            }
            owner_senders.push(tx);
            owners.push(tokio::spawn(prefix_owner(
                state,
                rx,
                writer.clone(),
                metrics.clone(),
                stop.clone(),
            )));
        }

        // One task per check.
        let mut check_tasks = Vec::with_capacity(checks.len());
        for scheduled in checks {
            let senders = targets.remove(&scheduled.spec.name).unwrap_or_default();
            if senders.is_empty() {
                warn!(check = %scheduled.spec.name, "Health check bound to no prefix, not scheduled");
                continue;
            }
            check_tasks.push(tokio::spawn(check_loop(
                scheduled,
                senders,
                metrics.clone(),
                stop.clone(),
            )));
        }

        // Inbound side.
        let mut decoder: Option<JoinHandle<exabgp_api::Result<()>>> = None;
        let mut learner: Option<JoinHandle<()>> = None;
        if let Some(reader) = events {
            let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
            decoder = Some(tokio::spawn(decode_loop(reader, tx, stop.clone())));
            learner = Some(tokio::spawn(learn_loop(
                rx,
                learning,
                advertised,
                owner_senders.clone(),
                metrics.clone(),
            )));
        }
        info!("Announcer running");

        let mut decoder_finished = false;
        let mut fatal: Option<AnnouncerError> = match decoder.as_mut() {
            Some(handle) => tokio::select! {
                _ = stop.cancelled() => None,
                joined = handle => {
                    decoder_finished = true;
                    match joined {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(AnnouncerError::Api(e)),
                        Err(e) => Some(AnnouncerError::Shutdown(format!("decode task failed: {}", e))),
                    }
                }
            },
            None => {
                stop.cancelled().await;
                None
            }
        };
        if decoder_finished {
            decoder = None;
        }

        if let Some(e) = &fatal {
            error!(error = %e, "Event channel lost, shutting down");
        } else {
            info!("Shutting down");
        }
        stop.cancel();

        // Probes finish their current cycle.
        for task in check_tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Health check task failed");
            }
        }
        if let Some(handle) = decoder {
            match handle.await {
                Ok(Err(e)) => debug!(error = %e, "Decode loop ended with error during shutdown"),
                Err(e) => warn!(error = %e, "Decode task failed"),
                Ok(Ok(())) => {}
            }
        }
        if let Some(handle) = learner {
            if let Err(e) = handle.await {
                warn!(error = %e, "Learn task failed");
            }
        }

        // Owners drain once every sender is gone.
        drop(owner_senders);
        let mut states = Vec::with_capacity(owners.len());
        let mut lost: Vec<ApiError> = Vec::new();
        for owner in owners {
            match owner.await {
                Ok(exit) => {
                    states.push(exit.state);
                    lost.extend(exit.lost);
                }
                Err(e) => error!(error = %e, "Prefix owner task failed"),
            }
        }
        if fatal.is_none() {
            fatal = first_cause(lost).map(AnnouncerError::Api);
        }

        let report = withdraw_sweep(&states, &writer, &metrics).await;
        if let Err(e) = writer.close().await {
            warn!(error = %e, "Failed to close command channel");
        }
        info!(
            withdrawn = report.withdrawn,
            failed = report.failed,
            "Announcer stopped"
        );

        if let Some(e) = fatal {
            return Err(e);
        }
        if report.failed > 0 {
            return Err(AnnouncerError::Shutdown(format!(
                "{} of {} shutdown withdraws failed",
                report.failed,
                report.failed + report.withdrawn
            )));
        }
        Ok(report)
    }
}

async fn withdraw_sweep(
    states: &[RouteState],
    writer: &CommandWriter,
    metrics: &MetricsCollector,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();
    for state in states {
        let Some(command) = state.shutdown_command() else {
            continue;
        };
        match writer.send(&command).await {
            Ok(()) => {
                info!(prefix = %state.prefix(), "Withdrew prefix for shutdown");
                metrics.record_command(CommandKind::Withdraw);
                if state.last_emitted() == Some(CommandKind::Announce) {
                    metrics.record_transition(false);
                }
                report.withdrawn += 1;
            }
            Err(e) => {
                error!(prefix = %state.prefix(), error = %e, "Shutdown withdraw failed");
                metrics.record_emission_failure();
                report.failed += 1;
            }
        }
    }
    report
}

/// What a prefix owner hands back when it stops
struct OwnerExit {
    state: RouteState,
    /// Write error that left the command channel closed
    lost: Option<ApiError>,
}

/// The root cause among the owners' write errors.
///
/// Owners that wrote after the channel closed only see `ChannelClosed`.
fn first_cause(errors: Vec<ApiError>) -> Option<ApiError> {
    let mut closed = None;
    for e in errors {
        match e {
            ApiError::ChannelClosed => closed = Some(ApiError::ChannelClosed),
            cause => return Some(cause),
        }
    }
    closed
}

/// Single owner of one prefix's route state.
///
/// Stops early and cancels `stop` when the command channel is lost.
async fn prefix_owner(
    mut state: RouteState,
    mut rx: mpsc::Receiver<PrefixInput>,
    writer: CommandWriter,
    metrics: MetricsCollector,
    stop: CancellationToken,
) -> OwnerExit {
    let mut lost = None;
    if let Some(command) = state.initial_command() {
        lost = emit(&mut state, command, &writer, &metrics).await.err();
    }

    while lost.is_none() {
        let Some(input) = rx.recv().await else {
            break;
        };
        match input {
            PrefixInput::Result(result) => {
                if let Some(command) = state.record(&result) {
                    lost = emit(&mut state, command, &writer, &metrics).await.err();
                }
            }
            PrefixInput::PeerUp(peer) => {
                let Some(command) = state.reannounce_command(peer) else {
                    continue;
                };
                match writer.send(&command).await {
                    Ok(()) => info!(prefix = %state.prefix(), peer = %peer, "Re-announced prefix to peer"),
                    Err(e) => {
                        metrics.record_emission_failure();
                        warn!(prefix = %state.prefix(), peer = %peer, error = %e, "Re-announce failed");
                        if writer.is_closed().await {
                            lost = Some(e);
                        }
                    }
                }
            }
        }
    }

    if let Some(e) = &lost {
        error!(prefix = %state.prefix(), error = %e, "Command channel lost, shutting down");
        stop.cancel();
    }
    OwnerExit { state, lost }
}

/// Write `command` and commit it on success.
///
/// A failure that leaves the writer open is retried on the next decided
/// transition. A failure that closes it is returned.
async fn emit(
    state: &mut RouteState,
    command: Command,
    writer: &CommandWriter,
    metrics: &MetricsCollector,
) -> exabgp_api::Result<()> {
    let was_announced = state.last_emitted() == Some(CommandKind::Announce);
    match writer.send(&command).await {
        Ok(()) => {
            state.commit(&command);
            metrics.record_command(command.kind());
            let now_announced = command.kind() == CommandKind::Announce;
            if now_announced != was_announced {
                metrics.record_transition(now_announced);
            }
            match state.status() {
                RouteStatus::Up => info!(prefix = %state.prefix(), command = %command, "Announced prefix"),
                RouteStatus::Down => info!(prefix = %state.prefix(), command = %command, "Withdrew prefix"),
            }
        }
        Err(e) => {
            metrics.record_emission_failure();
            if writer.is_closed().await {
                return Err(e);
            }
            error!(
                prefix = %state.prefix(),
                command = %command,
                error = %e,
                "Command emission failed, will retry on next result"
            );
        }
    }
    Ok(())
}

/// Probe one check on its interval and fan results out to bound prefixes.
///
/// Cancellation is observed only between cycles.
async fn check_loop(
    scheduled: ScheduledCheck,
    targets: Vec<mpsc::Sender<PrefixInput>>,
    metrics: MetricsCollector,
    stop: CancellationToken,
) {
    let ScheduledCheck { spec, check } = scheduled;
    let mut ticker = tokio::time::interval(spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(check = %spec.name, interval = ?spec.interval, "Health check scheduled");

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = run_probe(check.as_ref(), spec.timeout).await;
        metrics.record_probe(&spec.name, result.outcome);
        debug!(check = %spec.name, outcome = result.outcome.as_str(), "Probe complete");

        for tx in &targets {
            if tx.send(PrefixInput::Result(result.clone())).await.is_err() {
                debug!(check = %spec.name, "Prefix owner gone");
            }
        }
    }
    debug!(check = %spec.name, "Health check stopped");
}

/// Consume decoded events: FIB updates and peer session changes.
async fn learn_loop(
    mut rx: mpsc::Receiver<Decoded>,
    mut learning: Learning,
    advertised: Vec<IpPrefix>,
    owners: Vec<mpsc::Sender<PrefixInput>>,
    metrics: MetricsCollector,
) {
    while let Some(item) = rx.recv().await {
        let event = match item {
            Decoded::Event(event) => event,
            Decoded::Fault { .. } => {
                metrics.record_decode_error();
                continue;
            }
        };
        metrics.record_event();

        match event {
            Event::Ack(Ack::Done) => debug!("Daemon acknowledged command"),
            Event::Ack(Ack::Error) => warn!("Daemon rejected a command"),
            Event::Ack(Ack::Shutdown) => warn!("Daemon reports it is shutting down"),
            Event::Neighbor(change) => {
                match &change.state {
                    PeerState::Up => {
                        info!(peer = %change.peer, "Peer session up");
                        for tx in &owners {
                            // Owners only disappear during shutdown.
                            let _ = tx.send(PrefixInput::PeerUp(change.peer)).await;
                        }
                    }
                    PeerState::Down { reason } => {
                        warn!(peer = %change.peer, reason = reason.as_deref().unwrap_or("unknown"), "Peer session down");
                    }
                    PeerState::Connected => info!(peer = %change.peer, "Peer connected"),
                    PeerState::Other(state) => info!(peer = %change.peer, state = %state, "Peer state changed"),
                }
                if let (Some(consumer), Some(operation)) =
                    (learning.consumer.as_mut(), change.fib_operation())
                {
                    consumer.handle(vec![operation]).await;
                }
            }
            Event::Update(update) => {
                if update.direction == Direction::Send {
                    debug!(peer = %update.peer, "Ignoring update we sent");
                    continue;
                }
                let Some(consumer) = learning.consumer.as_mut() else {
                    continue;
                };
                let operations =
                    remove_internal_networks(&advertised, update.prefixes, learning.allow_default);
                if operations.is_empty() {
                    debug!(peer = %update.peer, "Update held no external prefixes");
                    continue;
                }
                consumer.handle(operations).await;
            }
            Event::Other { kind, .. } => debug!(kind = %kind, "Ignoring daemon message"),
        }
    }
    debug!("Learn task stopped");
}

