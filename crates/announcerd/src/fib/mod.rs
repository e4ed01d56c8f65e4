//! Learned-route programming
//!
//! Routes received from BGP peers are filtered against our own
//! advertisements, tracked in a [`LearnedRoutes`] table and handed to every
//! configured [`FibHandler`].
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SC-7: Boundary Protection - Our own summaries are never installed as learned routes
//! - SC-5: Denial of Service Protection - Learned prefix limit
//! - CM-6: Configuration Settings - Default routes installed only when allowed

pub mod learned;
pub mod linux;

pub use learned::{AddOutcome, LearnedRoutes};
pub use linux::LinuxFib;

use crate::config::LearnConfig;
use crate::error::{AnnouncerError, Result};
use crate::metrics::MetricsCollector;
use async_trait::async_trait;
use exabgp_api::{FibOperation, FibPrefix};
use exabgp_types::IpPrefix;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// OS or router specific route programming
#[async_trait]
pub trait FibHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn apply_route(&self, route: &FibPrefix) -> Result<()>;

    async fn remove_route(&self, route: &FibPrefix) -> Result<()>;
}

/// Build the handlers named in `learn.fibs`.
pub fn handlers_from_config(learn: &LearnConfig) -> Result<Vec<Arc<dyn FibHandler>>> {
    learn
        .fibs
        .iter()
        .map(|name| match name.as_str() {
            "linux" => Ok(Arc::new(LinuxFib::from_config(learn)) as Arc<dyn FibHandler>),
            other => Err(AnnouncerError::Config(format!("unknown FIB {:?}", other))),
        })
        .collect()
}

/// Drop learned routes that are, or overlap, prefixes we advertise.
///
/// Default routes pass only when `allow_default` is set, even though they
/// overlap everything. The result is sorted IPv4 first, then IPv6.
pub fn remove_internal_networks(
    advertised: &[IpPrefix],
    routes: Vec<FibPrefix>,
    allow_default: bool,
) -> Vec<FibPrefix> {
    let mut kept: Vec<FibPrefix> = routes
        .into_iter()
        .filter(|route| {
            if route.prefix.is_default() {
                if !allow_default {
                    debug!(prefix = %route.prefix, "Default route not allowed");
                }
                return allow_default;
            }
            match advertised.iter().find(|a| a.overlaps(&route.prefix)) {
                Some(summary) => {
                    debug!(
                        prefix = %route.prefix,
                        advertised = %summary,
                        "Not installing a prefix we advertise over BGP"
                    );
                    false
                }
                None => true,
            }
        })
        .collect();

    kept.sort_by(|a, b| {
        (a.prefix, a.next_hop, a.operation).cmp(&(b.prefix, b.next_hop, b.operation))
    });
    kept.dedup_by(|a, b| {
        a.prefix == b.prefix && a.next_hop == b.next_hop && a.operation == b.operation
    });
    kept
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Apply,
    Remove,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Apply => "add",
            Action::Remove => "remove",
        }
    }
}

/// Applies FIB operations to every handler, tracking what was learned
pub struct FibConsumer {
    handlers: Vec<Arc<dyn FibHandler>>,
    learned: LearnedRoutes,
    dry_run: bool,
    metrics: MetricsCollector,
}

impl FibConsumer {
    pub fn new(
        handlers: Vec<Arc<dyn FibHandler>>,
        prefix_limit: usize,
        dry_run: bool,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            handlers,
            learned: LearnedRoutes::new(prefix_limit),
            dry_run,
            metrics,
        }
    }

    pub fn learned(&self) -> &LearnedRoutes {
        &self.learned
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Apply a batch of operations in order.
    pub async fn handle(&mut self, operations: Vec<FibPrefix>) {
        for operation in operations {
            match operation.operation {
                FibOperation::Add => match self.learned.add(&operation) {
                    AddOutcome::Added => self.dispatch(&operation, Action::Apply).await,
                    AddOutcome::Replaced(old) => {
                        self.dispatch(&old, Action::Remove).await;
                        self.dispatch(&operation, Action::Apply).await;
                    }
                    AddOutcome::Released(old) => {
                        self.dispatch(&old, Action::Remove).await;
                    }
                    AddOutcome::Unchanged => {
                        debug!(prefix = %operation.prefix, peer = %operation.peer, "Learned route unchanged");
                    }
                    AddOutcome::LimitReached => {
                        error!(
                            prefix = %operation.prefix,
                            peer = %operation.peer,
                            limit = self.learned.len(),
                            "Learned prefix limit reached, route not installed"
                        );
                    }
                },
                FibOperation::Remove => {
                    match self.learned.remove(&operation.prefix, operation.peer) {
                        Some(route) => self.dispatch(&route, Action::Remove).await,
                        None => {
                            debug!(prefix = %operation.prefix, peer = %operation.peer, "Withdraw left no route to remove");
                        }
                    }
                }
                FibOperation::RemoveAll => {
                    let removed = self.learned.remove_all(operation.peer);
                    info!(peer = %operation.peer, count = removed.len(), "Removing all routes learned from peer");
                    for route in &removed {
                        self.dispatch(route, Action::Remove).await;
                    }
                }
            }
        }
        self.metrics.set_learned_prefixes(self.learned.len());
    }

    async fn dispatch(&self, route: &FibPrefix, action: Action) {
        for handler in &self.handlers {
            if self.dry_run {
                info!(
                    fib = handler.name(),
                    prefix = %route.prefix,
                    next_hop = %route.next_hop,
                    action = action.as_str(),
                    "[DRY RUN] Would program route"
                );
                continue;
            }

            let result = match action {
                Action::Apply => handler.apply_route(route).await,
                Action::Remove => handler.remove_route(route).await,
            };
            self.metrics
                .record_fib_operation(handler.name(), action.as_str(), result.is_ok());
            if let Err(e) = result {
                warn!(
                    fib = handler.name(),
                    prefix = %route.prefix,
                    action = action.as_str(),
                    error = %e,
                    "FIB operation failed"
                );
            }
        }
    }
}
