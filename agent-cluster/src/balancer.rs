// Load balancing strategies for agent placement

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::node::Node;

/// Node selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cycle through candidates in id order
    RoundRobin,

    /// Lowest load factor, ties broken by lowest id
    LeastLoaded,

    /// Random choice weighted by remaining headroom
    Weighted,

    /// Least loaded among nodes strictly below capacity
    CapacityAware,

    /// Least loaded among nodes advertising the requested service
    ServiceAffinity,
}

impl Strategy {
    /// Every strategy, in declaration order
    pub const ALL: [Strategy; 5] = [
        Strategy::RoundRobin,
        Strategy::LeastLoaded,
        Strategy::Weighted,
        Strategy::CapacityAware,
        Strategy::ServiceAffinity,
    ];

    /// Wire name of the strategy
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastLoaded => "least_loaded",
            Strategy::Weighted => "weighted",
            Strategy::CapacityAware => "capacity_aware",
            Strategy::ServiceAffinity => "service_affinity",
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::LeastLoaded
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| ClusterError::ConfigurationError(format!("Unknown strategy: {}", s)))
    }
}

/// Stateless node selection, apart from the round-robin cursor and the RNG.
///
/// Selection never touches node load; the coordinator records the assignment
/// and the node's next heartbeat reports the new load.
#[derive(Debug)]
pub struct LoadBalancer {
    // Shared by every caller, advanced atomically per round-robin call
    cursor: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    /// Create a balancer with an entropy-seeded RNG
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a balancer whose weighted choices are reproducible
    pub fn with_seed(seed: u64) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Rewind the round-robin cursor
    pub fn reset_cursor(&self) {
        self.cursor.store(0, AtomicOrdering::SeqCst);
    }

    /// Select one node from `candidates` using `strategy`.
    ///
    /// `service` is only consulted by [`Strategy::ServiceAffinity`]. Nodes with
    /// zero capacity are never selected.
    pub fn select<'a>(
        &self,
        candidates: &'a [Node],
        strategy: Strategy,
        service: Option<&str>,
    ) -> ClusterResult<&'a Node> {
        let candidates: Vec<&Node> = candidates.iter().filter(|n| n.capacity > 0).collect();
        if candidates.is_empty() {
            return Err(ClusterError::NoAvailableNodes);
        }

        match strategy {
            Strategy::RoundRobin => self.select_round_robin(candidates),
            Strategy::LeastLoaded => select_least_loaded(candidates),
            Strategy::Weighted => self.select_weighted(candidates),
            Strategy::CapacityAware => select_least_loaded(
                candidates
                    .into_iter()
                    .filter(|n| n.load < n.capacity)
                    .collect(),
            ),
            Strategy::ServiceAffinity => match service {
                Some(service) => select_least_loaded(
                    candidates
                        .into_iter()
                        .filter(|n| n.has_service(service))
                        .collect(),
                ),
                None => select_least_loaded(candidates),
            },
        }
    }

    fn select_round_robin<'a>(&self, mut candidates: Vec<&'a Node>) -> ClusterResult<&'a Node> {
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let index = self.cursor.fetch_add(1, AtomicOrdering::SeqCst) % candidates.len();
        Ok(candidates[index])
    }

    fn select_weighted<'a>(&self, candidates: Vec<&'a Node>) -> ClusterResult<&'a Node> {
        let mut weighted: Vec<(&Node, u64)> = candidates
            .into_iter()
            .map(|n| (n, n.headroom() as u64))
            .filter(|(_, weight)| *weight > 0)
            .collect();
        weighted.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        let total: u64 = weighted.iter().map(|(_, weight)| weight).sum();
        if total == 0 {
            return Err(ClusterError::NoAvailableNodes);
        }

        let mut pick = self.rng.lock().gen_range(0..total);
        for (node, weight) in &weighted {
            if pick < *weight {
                return Ok(*node);
            }
            pick -= *weight;
        }

        // Unreachable while pick < total
        Err(ClusterError::NoAvailableNodes)
    }
}

fn select_least_loaded(candidates: Vec<&Node>) -> ClusterResult<&Node> {
    candidates
        .into_iter()
        .min_by(|a, b| compare_load(a, b))
        .ok_or(ClusterError::NoAvailableNodes)
}

fn compare_load(a: &Node, b: &Node) -> Ordering {
    a.load_factor()
        .total_cmp(&b.load_factor())
        .then_with(|| a.id.cmp(&b.id))
}
