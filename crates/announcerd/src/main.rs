//! ExaBGP announcer daemon
//!
//! Main entry point for announcerd. Started by ExaBGP as a process-API
//! helper: commands go to stdout, events arrive on stdin, and every log
//! line goes to stderr or a file.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log daemon lifecycle
//! - CP-10: System Recovery - Withdraw sweep on SIGINT/SIGTERM

use clap::{Parser, ValueEnum};
use exabgp_announcerd::fib::handlers_from_config;
use exabgp_announcerd::{
    Announcer, AnnouncerConfig, FibConsumer, MetricsCollector, Result,
    DEFAULT_CONFIG_PATH, EXIT_CONFIG,
};
use exabgp_api::{PipePaths, Transport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Health-check driven BGP route announcer for ExaBGP
#[derive(Parser, Debug)]
#[command(name = "announcerd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log commands instead of sending them, and leave FIBs untouched
    #[arg(short = 'D', long)]
    dry_run: bool,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Log to this file instead of stderr
    #[arg(short = 'l', long)]
    log_file: Option<PathBuf>,

    /// Log line format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("announcerd: failed to initialize logging: {}", e);
        return exit_code(EXIT_CONFIG);
    }

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "announcerd: Invalid configuration");
            return exit_code(e.exit_code());
        }
    };
    if args.check_config {
        info!(config = %args.config.display(), "announcerd: Configuration OK");
        return ExitCode::SUCCESS;
    }

    info!(
        config = %args.config.display(),
        prefixes = config.advertise.prefixes.len(),
        healthchecks = config.healthchecks.len(),
        dry_run = args.dry_run,
        "announcerd: Starting"
    );

    match run_daemon(config, args.dry_run).await {
        Ok(()) => {
            info!("announcerd: Exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "announcerd: Exiting with error");
            exit_code(e.exit_code())
        }
    }
}

/// Initialize structured logging
///
/// `RUST_LOG` overrides the level chosen on the command line. Nothing is
/// ever logged to stdout, which carries daemon commands.
///
/// # NIST Controls
/// - AU-3: Content of Audit Records - Structured format
fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(args.log_file.is_none())
        .with_target(true)
        .with_file(true)
        .with_line_number(true);
    let layer = match args.log_format {
        LogFormat::Text => fmt_layer.compact().with_filter(filter).boxed(),
        LogFormat::Json => fmt_layer.json().with_filter(filter).boxed(),
    };

    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

fn load_config(path: &Path) -> Result<AnnouncerConfig> {
    let config = AnnouncerConfig::load(path)?;
    config.validate()?;
    Ok(config)
}

fn open_transport(config: &AnnouncerConfig) -> Result<Transport> {
    let transport = match (&config.channel.in_pipe, &config.channel.out_pipe) {
        (Some(in_pipe), Some(out_pipe)) => Transport::open_pipes(&PipePaths {
            in_pipe: in_pipe.clone(),
            out_pipe: out_pipe.clone(),
        })?,
        _ => Transport::stdio(),
    };
    Ok(transport.with_write_timeout(config.emit_timeout()))
}

/// Main daemon body
///
/// # NIST Controls
/// - SI-4: System Monitoring - Runs probes until shutdown
/// - CP-10: System Recovery - Announcer withdraws before returning
async fn run_daemon(config: AnnouncerConfig, dry_run: bool) -> Result<()> {
    let metrics = MetricsCollector::new()?;

    let mut transport = open_transport(&config)?;
    if dry_run {
        transport = transport.into_dry_run();
    }
    let (writer, reader) = transport.into_parts();

    let mut announcer = Announcer::from_config(&config, writer, metrics.clone())?;
    let handlers = handlers_from_config(&config.learn)?;
    if !handlers.is_empty() {
        info!(fibs = ?config.learn.fibs, "announcerd: Programming learned routes");
        let consumer = FibConsumer::new(handlers, config.learn.prefix_limit, dry_run, metrics.clone());
        announcer = announcer.with_fib_consumer(consumer, config.learn.allow_default);
    }

    let cancel = CancellationToken::new();
    setup_signal_handlers(cancel.clone())?;

    let result = announcer.run(reader, cancel).await;

    match metrics.gather_text() {
        Ok(text) => debug!(metrics = %text, "announcerd: Final metrics"),
        Err(e) => warn!(error = %e, "announcerd: Failed to gather metrics"),
    }

    let report = result?;
    info!(withdrawn = report.withdrawn, "announcerd: Graceful shutdown complete");
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM.
///
/// # NIST Controls
/// - AU-12: Audit Record Generation - Log shutdown signals
fn setup_signal_handlers(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("announcerd: Received SIGTERM"),
            _ = sigint.recv() => info!("announcerd: Received SIGINT"),
        }
        cancel.cancel();
    });
    Ok(())
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["announcerd"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!args.dry_run);
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn test_args_short_flags() {
        let args = Args::parse_from(["announcerd", "-c", "/tmp/a.toml", "-D", "-d"]);
        assert_eq!(args.config, PathBuf::from("/tmp/a.toml"));
        assert!(args.dry_run);
        assert!(args.debug);
    }

    #[test]
    fn test_log_format_json() {
        let args = Args::parse_from(["announcerd", "--log-format", "json", "--check-config"]);
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(args.check_config);
    }
}
