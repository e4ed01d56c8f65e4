//! Health-check driven route announcer for ExaBGP
//!
//! announcerd runs as an ExaBGP process-API helper. It probes configured
//! health checks on their own schedules, drives an Up/Down state machine
//! per advertised prefix, and writes `announce`/`withdraw` commands to the
//! daemon. Routes received from peers can optionally be programmed into
//! one or more FIBs.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AU-3 | Content of Audit Records | Structured logging of every emitted command |
//! | AU-12 | Audit Record Generation | Transitions and FIB changes logged |
//! | CM-6 | Configuration Settings | Validated TOML/JSON configuration |
//! | CP-10 | System Recovery | Withdraw sweep on shutdown |
//! | SC-5 | DoS Protection | Learned prefix limit, bounded line length |
//! | SC-7 | Boundary Protection | Unhealthy prefixes withdrawn |
//! | SI-4 | System Monitoring | Concurrent health probing |
//! | SI-10 | Input Validation | Event channel decoding |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────────────────┐     ┌──────────────┐
//! │ Health checks│────▶│ RouteState (1 per prefix)   │────▶│              │
//! │ ping / route │     │ Up/Down + thresholds        │     │    ExaBGP    │
//! └──────────────┘     └─────────────────────────────┘     │              │
//!                      ┌─────────────────────────────┐     │  process API │
//!    kernel FIB ◀──────│ FibConsumer + LearnedRoutes │◀────│              │
//!                      └─────────────────────────────┘     └──────────────┘
//! ```

pub mod announcer;
pub mod config;
pub mod error;
pub mod fib;
pub mod healthcheck;
pub mod metrics;
pub mod route_state;
pub mod shell;

pub use announcer::{Announcer, ScheduledCheck, ShutdownReport};
pub use config::{AnnouncerConfig, HealthCheckSpec, PrefixSpec, DEFAULT_CONFIG_PATH};
pub use error::{AnnouncerError, Result, EXIT_CONFIG, EXIT_RUNTIME};
pub use fib::{FibConsumer, FibHandler, LinuxFib};
pub use healthcheck::{HealthCheck, HealthCheckResult, Outcome};
pub use metrics::MetricsCollector;
pub use route_state::{InitialPosture, RouteState, RouteStatus, Thresholds};
