//! Leader election rule
//!
//! Leadership goes to the healthy node with the lowest id. There is no voting
//! round: every coordinator that sees the same membership picks the same
//! leader. Two coordinators that see different membership (a network
//! partition) can pick different leaders; that split brain is accepted.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeId};

/// Why an election ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionReason {
    /// No leader was recorded
    NoLeader,
    /// The recorded leader stopped heartbeating
    LeaderUnhealthy,
    /// The recorded leader was evicted by the sweep
    LeaderEvicted,
    /// The recorded leader was deregistered
    LeaderRemoved,
    /// Requested by an operator
    Explicit,
}

impl fmt::Display for ElectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ElectionReason::NoLeader => "no leader",
            ElectionReason::LeaderUnhealthy => "leader unhealthy",
            ElectionReason::LeaderEvicted => "leader evicted",
            ElectionReason::LeaderRemoved => "leader removed",
            ElectionReason::Explicit => "explicit",
        };
        f.write_str(reason)
    }
}

/// One leadership transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadershipChange {
    /// Leader before the election
    pub previous: Option<NodeId>,
    /// Leader after the election
    pub current: Option<NodeId>,
    /// What triggered the election
    pub reason: ElectionReason,
    /// When the change was applied
    pub at: DateTime<Utc>,
}

/// Lowest-id healthy node, if any
pub fn choose_leader(nodes: &[Node], now: Instant, timeout: Duration) -> Option<NodeId> {
    nodes
        .iter()
        .filter(|node| node.is_healthy(now, timeout))
        .map(|node| &node.id)
        .min()
        .cloned()
}

/// Decide whether the recorded leader must be replaced.
///
/// `nodes` is the full membership. A healthy leader is never pre-empted here,
/// even if a lower id has joined since.
pub fn election_trigger(
    leader: Option<&NodeId>,
    nodes: &[Node],
    now: Instant,
    timeout: Duration,
) -> Option<ElectionReason> {
    let Some(leader) = leader else {
        return Some(ElectionReason::NoLeader);
    };

    match nodes.iter().find(|node| &node.id == leader) {
        None => Some(ElectionReason::LeaderEvicted),
        Some(node) if !node.is_healthy(now, timeout) => Some(ElectionReason::LeaderUnhealthy),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::registration;

    fn nodes(now: Instant, ids: &[&str]) -> Vec<Node> {
        ids.iter()
            .map(|id| Node::new(registration(id, 1).validate().unwrap(), now))
            .collect()
    }

    #[test]
    fn test_choose_lowest_healthy() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut all = nodes(start, &["n3", "n1", "n2"]);

        assert_eq!(choose_leader(&all, start, timeout), Some(NodeId::from("n1")));

        // n1 stops heartbeating; n2 and n3 keep going
        let later = start + Duration::from_secs(15);
        for node in all.iter_mut().filter(|n| n.id != NodeId::from("n1")) {
            node.last_heartbeat = later;
        }
        assert_eq!(choose_leader(&all, later, timeout), Some(NodeId::from("n2")));

        assert_eq!(choose_leader(&all, later + timeout, timeout), None);
        assert_eq!(choose_leader(&[], start, timeout), None);
    }

    #[test]
    fn test_election_trigger() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let all = nodes(start, &["n1", "n2"]);
        let n1 = NodeId::from("n1");
        let n2 = NodeId::from("n2");

        assert_eq!(election_trigger(None, &all, start, timeout), Some(ElectionReason::NoLeader));
        assert_eq!(election_trigger(Some(&n1), &all, start, timeout), None);
        // Healthy leader that is not lowest id is kept
        assert_eq!(election_trigger(Some(&n2), &all, start, timeout), None);
        assert_eq!(
            election_trigger(Some(&n1), &all, start + timeout, timeout),
            Some(ElectionReason::LeaderUnhealthy)
        );
        assert_eq!(
            election_trigger(Some(&NodeId::from("gone")), &all, start, timeout),
            Some(ElectionReason::LeaderEvicted)
        );
    }
}
