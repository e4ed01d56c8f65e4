//! End-to-end announcer runs against scripted health checks and an
//! in-memory daemon.

use async_trait::async_trait;
use exabgp_announcerd::config::CheckKind;
use exabgp_announcerd::fib::FibHandler;
use exabgp_announcerd::{
    Announcer, AnnouncerError, FibConsumer, HealthCheck, HealthCheckSpec, InitialPosture,
    MetricsCollector, PrefixSpec, ScheduledCheck, ShutdownReport,
};
use exabgp_api::{ApiError, CommandWriter, EventReader, FibPrefix, RouteAttributes};
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PEER: &str = "fc00:0:0:69::2";

/// Answers from a script, then `fallback` forever.
struct Scripted {
    name: String,
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
}

impl Scripted {
    fn new(name: &str, script: &[bool], fallback: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.iter().copied().collect()),
            fallback,
        })
    }
}

#[async_trait]
impl HealthCheck for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self, _timeout: Duration) -> exabgp_announcerd::Result<bool> {
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(self.fallback))
    }
}

#[derive(Default)]
struct RecordingFib {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl FibHandler for RecordingFib {
    fn name(&self) -> &str {
        "recording"
    }

    async fn apply_route(&self, route: &FibPrefix) -> exabgp_announcerd::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("add {} via {}", route.prefix, route.next_hop));
        Ok(())
    }

    async fn remove_route(&self, route: &FibPrefix) -> exabgp_announcerd::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("remove {} via {}", route.prefix, route.next_hop));
        Ok(())
    }
}

fn check(name: &str, failure: u32, success: u32, probe: Arc<Scripted>) -> ScheduledCheck {
    let spec = HealthCheckSpec {
        name: name.to_string(),
        kind: CheckKind::Ping,
        target: "127.0.0.1".parse().unwrap(),
        interval: Duration::from_secs(1),
        timeout: Duration::from_millis(500),
        failure_threshold: failure,
        success_threshold: success,
        ping_count: 1,
        ping_wait: Duration::from_secs(1),
    };
    ScheduledCheck::new(spec, probe)
}

fn prefix(prefix: &str, checks: &[&str]) -> PrefixSpec {
    PrefixSpec {
        prefix: prefix.parse().unwrap(),
        checks: checks.iter().map(|c| c.to_string()).collect(),
        attributes: RouteAttributes::default(),
    }
}

/// Daemon side of the command channel: every line until EOF.
fn daemon_reader(server: DuplexStream) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(server).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(line);
        }
        out
    })
}

fn state_line(state: &str) -> String {
    format!(
        concat!(
            r#"{{"exabgp": "4.0.1", "time": 1563994945.43, "type": "state", "#,
            r#""neighbor": {{"address": {{"local": "fc00:0:0:69::1", "peer": "{}"}}, "#,
            r#""asn": {{"local": 65069, "peer": 65070}}, "state": "{}"}}}}"#
        ),
        PEER, state
    )
}

fn update_line(update: &str) -> String {
    format!(
        concat!(
            r#"{{"exabgp": "4.0.1", "time": 1562873630.53, "type": "update", "#,
            r#""neighbor": {{"address": {{"local": "fc00:0:0:69::1", "peer": "{}"}}, "#,
            r#""asn": {{"local": 65069, "peer": 65070}}, "direction": "receive", "#,
            r#""message": {{"update": {}}}}}}}"#
        ),
        PEER, update
    )
}

async fn run_for(announcer: Announcer, duration: Duration) -> exabgp_announcerd::Result<ShutdownReport> {
    let cancel = CancellationToken::new();
    let run = tokio::spawn(announcer.run(None, cancel.clone()));
    tokio::time::sleep(duration).await;
    cancel.cancel();
    run.await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_failure_threshold_withdraws_exactly_once() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let daemon = daemon_reader(server);
    let metrics = MetricsCollector::new().unwrap();

    let announcer = Announcer::new(
        vec![prefix("69::/32", &["upstream"])],
        vec![check("upstream", 3, 1, Scripted::new("upstream", &[true], false))],
        InitialPosture::AnnounceFirst,
        CommandWriter::new(client),
        metrics.clone(),
    )
    .unwrap();

    let report = run_for(announcer, Duration::from_secs(30)).await.unwrap();
    assert_eq!(report.withdrawn, 0);

    assert_eq!(
        daemon.await.unwrap(),
        vec![
            "announce route 69::/32 next-hop self",
            "withdraw route 69::/32 next-hop self",
        ]
    );
    assert_eq!(metrics.prefixes_up.get(), 0);
    assert!(
        metrics
            .probes_total
            .with_label_values(&["upstream", "unhealthy"])
            .get()
            >= 3
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_withdraws_every_up_prefix() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let daemon = daemon_reader(server);
    let metrics = MetricsCollector::new().unwrap();

    // Prefixes without checks are always Up.
    let announcer = Announcer::new(
        vec![prefix("69::/32", &[]), prefix("10.69.0.0/16", &[])],
        vec![],
        InitialPosture::WithdrawFirst,
        CommandWriter::new(client),
        metrics.clone(),
    )
    .unwrap();

    let report = run_for(announcer, Duration::from_secs(5)).await.unwrap();
    assert_eq!(report.withdrawn, 2);
    assert_eq!(report.failed, 0);

    let lines = daemon.await.unwrap();
    assert_eq!(lines.len(), 4);
    let mut announces = lines[..2].to_vec();
    announces.sort();
    assert_eq!(
        announces,
        vec![
            "announce route 10.69.0.0/16 next-hop self",
            "announce route 69::/32 next-hop self",
        ]
    );
    assert_eq!(
        &lines[2..],
        &[
            "withdraw route 69::/32 next-hop self",
            "withdraw route 10.69.0.0/16 next-hop self",
        ]
    );
    assert_eq!(metrics.prefixes_up.get(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_recovery_stays_down() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let daemon = daemon_reader(server);

    let announcer = Announcer::new(
        vec![prefix("69::/32", &["a", "b"])],
        vec![
            check("a", 1, 1, Scripted::new("a", &[], true)),
            check("b", 1, 1, Scripted::new("b", &[], false)),
        ],
        InitialPosture::WithdrawFirst,
        CommandWriter::new(client),
        MetricsCollector::new().unwrap(),
    )
    .unwrap();

    let report = run_for(announcer, Duration::from_secs(20)).await.unwrap();
    assert_eq!(report.withdrawn, 0);
    assert_eq!(
        daemon.await.unwrap(),
        vec!["withdraw route 69::/32 next-hop self"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_recovery_announces_after_success_threshold() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let daemon = daemon_reader(server);

    let announcer = Announcer::new(
        vec![prefix("69::/32", &["upstream"])],
        vec![check(
            "upstream",
            1,
            2,
            Scripted::new("upstream", &[false, false, true, false, true], true),
        )],
        InitialPosture::WithdrawFirst,
        CommandWriter::new(client),
        MetricsCollector::new().unwrap(),
    )
    .unwrap();

    let report = run_for(announcer, Duration::from_secs(20)).await.unwrap();
    assert_eq!(report.withdrawn, 1);
    assert_eq!(
        daemon.await.unwrap(),
        vec![
            "withdraw route 69::/32 next-hop self",
            "announce route 69::/32 next-hop self",
            "withdraw route 69::/32 next-hop self",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_counts_without_writing() {
    let metrics = MetricsCollector::new().unwrap();
    let writer = CommandWriter::dry_run();

    let announcer = Announcer::new(
        vec![prefix("69::/32", &["upstream"])],
        vec![check("upstream", 1, 1, Scripted::new("upstream", &[], true))],
        InitialPosture::AnnounceFirst,
        writer.clone(),
        metrics.clone(),
    )
    .unwrap();

    let report = run_for(announcer, Duration::from_secs(5)).await.unwrap();
    assert_eq!(report.withdrawn, 1);
    assert_eq!(
        metrics
            .commands_emitted_total
            .with_label_values(&["announce"])
            .get(),
        1
    );
    assert!(writer.is_dry_run());
}

#[tokio::test]
async fn test_event_eof_is_fatal_after_sweep() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let daemon = daemon_reader(server);
    let (mut events_tx, events_rx) = tokio::io::duplex(64 * 1024);

    let announcer = Announcer::new(
        vec![prefix("69::/32", &[])],
        vec![],
        InitialPosture::WithdrawFirst,
        CommandWriter::new(client),
        MetricsCollector::new().unwrap(),
    )
    .unwrap();

    let run = tokio::spawn(announcer.run(
        Some(EventReader::new(events_rx)),
        CancellationToken::new(),
    ));

    events_tx
        .write_all(format!("{}\n", state_line("up")).as_bytes())
        .await
        .unwrap();
    drop(events_tx);

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, AnnouncerError::Api(ApiError::ChannelClosed)));
    assert_eq!(err.exit_code(), 1);

    assert_eq!(
        daemon.await.unwrap(),
        vec![
            "announce route 69::/32 next-hop self".to_string(),
            format!("neighbor {} announce route 69::/32 next-hop self", PEER),
            "withdraw route 69::/32 next-hop self".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_command_channel_is_fatal() {
    // The daemon never reads, so the first command cannot be written.
    let (client, server) = tokio::io::duplex(8);
    let metrics = MetricsCollector::new().unwrap();

    let announcer = Announcer::new(
        vec![prefix("69::/32", &["upstream"])],
        vec![check("upstream", 1, 1, Scripted::new("upstream", &[true, true], false))],
        InitialPosture::AnnounceFirst,
        CommandWriter::new(client).with_write_timeout(Duration::from_millis(500)),
        metrics.clone(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let result = tokio::time::timeout(Duration::from_secs(60), announcer.run(None, cancel.clone()))
        .await
        .expect("run stops by itself");

    let err = result.unwrap_err();
    assert!(matches!(err, AnnouncerError::Api(ApiError::WriteTimeout(500))));
    assert_eq!(err.exit_code(), 1);
    assert!(!cancel.is_cancelled());
    // The announce and the shutdown withdraw.
    assert_eq!(metrics.emission_failures_total.get(), 2);
    drop(server);
}

#[tokio::test]
async fn test_learned_routes_reach_fib() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let daemon = daemon_reader(server);
    let (mut events_tx, events_rx) = tokio::io::duplex(64 * 1024);

    let fib = Arc::new(RecordingFib::default());
    let handler: Arc<dyn FibHandler> = fib.clone();
    let metrics = MetricsCollector::new().unwrap();
    let consumer = FibConsumer::new(vec![handler], 0, false, metrics.clone());

    let announcer = Announcer::new(
        vec![prefix("69::/32", &[])],
        vec![],
        InitialPosture::WithdrawFirst,
        CommandWriter::new(client),
        metrics.clone(),
    )
    .unwrap()
    .with_fib_consumer(consumer, false);

    let run = tokio::spawn(announcer.run(
        Some(EventReader::new(events_rx)),
        CancellationToken::new(),
    ));

    let lines = [
        // Overlaps our own advertisement: never installed.
        update_line(&format!(
            r#"{{"announce": {{"ipv6 unicast": {{"{}": [{{"nlri": "69::/48"}}, {{"nlri": "70::/32"}}]}}}}}}"#,
            PEER
        )),
        "not json".to_string(),
        update_line(r#"{"withdraw": {"ipv6 unicast": [{"nlri": "70::/32"}]}}"#),
        update_line(&format!(
            r#"{{"announce": {{"ipv6 unicast": {{"{}": [{{"nlri": "71::/32"}}]}}}}}}"#,
            PEER
        )),
        state_line("down"),
    ];
    for line in &lines {
        events_tx
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }
    drop(events_tx);

    assert!(run.await.unwrap().is_err());
    daemon.await.unwrap();

    assert_eq!(
        *fib.calls.lock().unwrap(),
        vec![
            format!("add 70::/32 via {}", PEER),
            format!("remove 70::/32 via {}", PEER),
            format!("add 71::/32 via {}", PEER),
            format!("remove 71::/32 via {}", PEER),
        ]
    );
    assert_eq!(metrics.decode_errors_total.get(), 1);
    assert_eq!(metrics.learned_prefixes.get(), 0);
}

#[test]
fn test_unknown_check_binding_rejected() {
    let result = Announcer::new(
        vec![prefix("69::/32", &["missing"])],
        vec![],
        InitialPosture::WithdrawFirst,
        CommandWriter::dry_run(),
        MetricsCollector::new().unwrap(),
    );
    assert!(matches!(result, Err(AnnouncerError::Config(_))));
}
