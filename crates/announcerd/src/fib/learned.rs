//! Table of routes learned from BGP peers.
//!
//! One FIB route exists per `(next hop, prefix)`. Several peers may
//! advertise it, for example a route reflector relaying a third-party next
//! hop, and the route stays installed until the last of them withdraws.

use exabgp_api::FibPrefix;
use exabgp_types::IpPrefix;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// Result of [`LearnedRoutes::add`]
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Added,
    /// The route was already installed, from this peer or another
    Unchanged,
    /// The peer moved the prefix to a new next hop; holds the old route
    Replaced(FibPrefix),
    /// The peer joined an installed route and its old route lost its last
    /// advertiser; holds the old route
    Released(FibPrefix),
    /// The table is full
    LimitReached,
}

#[derive(Debug, Clone)]
struct Learned {
    route: FibPrefix,
    peers: BTreeSet<IpAddr>,
}

/// Learned prefixes keyed by next hop
///
/// A peer advertises a prefix via at most one next hop.
#[derive(Debug, Clone, Default)]
pub struct LearnedRoutes {
    by_next_hop: BTreeMap<IpAddr, BTreeMap<IpPrefix, Learned>>,
    len: usize,
    prefix_limit: usize,
}

impl LearnedRoutes {
    /// `prefix_limit` of 0 means unlimited.
    pub fn new(prefix_limit: usize) -> Self {
        Self {
            prefix_limit,
            ..Self::default()
        }
    }

    /// Installed routes, not advertisements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, next_hop: &IpAddr, prefix: &IpPrefix) -> bool {
        self.entry(next_hop, prefix).is_some()
    }

    /// Number of peers currently advertising `prefix` via `next_hop`.
    pub fn advertisers(&self, next_hop: &IpAddr, prefix: &IpPrefix) -> usize {
        self.entry(next_hop, prefix).map_or(0, |l| l.peers.len())
    }

    pub fn add(&mut self, route: &FibPrefix) -> AddOutcome {
        let current = self.next_hop_of(&route.prefix, route.peer);
        if current == Some(route.next_hop) {
            return AddOutcome::Unchanged;
        }

        if self.contains(&route.next_hop, &route.prefix) {
            let released = current.and_then(|old| self.leave(old, &route.prefix, route.peer));
            if let Some(learned) = self
                .by_next_hop
                .get_mut(&route.next_hop)
                .and_then(|routes| routes.get_mut(&route.prefix))
            {
                learned.peers.insert(route.peer);
            }
            return match released {
                Some(old) => AddOutcome::Released(old),
                None => AddOutcome::Unchanged,
            };
        }

        let frees_slot = current.is_some_and(|old| self.advertisers(&old, &route.prefix) == 1);
        if !frees_slot && self.prefix_limit > 0 && self.len >= self.prefix_limit {
            return AddOutcome::LimitReached;
        }
        let previous = current.and_then(|old| self.leave(old, &route.prefix, route.peer));

        self.by_next_hop.entry(route.next_hop).or_default().insert(
            route.prefix,
            Learned {
                route: route.clone(),
                peers: BTreeSet::from([route.peer]),
            },
        );
        self.len += 1;

        match previous {
            Some(old) => AddOutcome::Replaced(old),
            None => AddOutcome::Added,
        }
    }

    /// Withdraw `prefix` as advertised by `peer`.
    ///
    /// Returns the route once no peer advertises it any more.
    pub fn remove(&mut self, prefix: &IpPrefix, peer: IpAddr) -> Option<FibPrefix> {
        let next_hop = self.next_hop_of(prefix, peer)?;
        self.leave(next_hop, prefix, peer)
    }

    /// Withdraw everything `peer` advertised, and every route via `peer`.
    ///
    /// Returns the routes that must leave the FIB.
    pub fn remove_all(&mut self, peer: IpAddr) -> Vec<FibPrefix> {
        let mut removed = Vec::new();
        self.by_next_hop.retain(|next_hop, routes| {
            routes.retain(|_, learned| {
                learned.peers.remove(&peer);
                let drop = *next_hop == peer || learned.peers.is_empty();
                if drop {
                    removed.push(learned.route.clone());
                }
                !drop
            });
            !routes.is_empty()
        });
        self.len -= removed.len();
        removed
    }

    /// Every installed route, grouped by next hop.
    pub fn routes(&self) -> impl Iterator<Item = &FibPrefix> {
        self.by_next_hop
            .values()
            .flat_map(|routes| routes.values().map(|l| &l.route))
    }

    fn entry(&self, next_hop: &IpAddr, prefix: &IpPrefix) -> Option<&Learned> {
        self.by_next_hop.get(next_hop)?.get(prefix)
    }

    fn next_hop_of(&self, prefix: &IpPrefix, peer: IpAddr) -> Option<IpAddr> {
        self.by_next_hop
            .iter()
            .find(|(_, routes)| routes.get(prefix).is_some_and(|l| l.peers.contains(&peer)))
            .map(|(next_hop, _)| *next_hop)
    }

    /// Drop `peer` from one route, removing the route when it was the last.
    fn leave(&mut self, next_hop: IpAddr, prefix: &IpPrefix, peer: IpAddr) -> Option<FibPrefix> {
        let routes = self.by_next_hop.get_mut(&next_hop)?;
        let learned = routes.get_mut(prefix)?;
        learned.peers.remove(&peer);
        if !learned.peers.is_empty() {
            return None;
        }

        let learned = routes.remove(prefix)?;
        if routes.is_empty() {
            self.by_next_hop.remove(&next_hop);
        }
        self.len -= 1;
        Some(learned.route)
    }
}
