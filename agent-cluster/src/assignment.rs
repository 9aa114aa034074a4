//! Agent assignments recorded by the coordinator.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::balancer::Strategy;
use crate::error::{ClusterError, ClusterResult};
use crate::node::NodeId;

/// A unit of work bound to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Unique id of this binding; a reassignment gets a new one
    pub id: Uuid,

    /// Agent the work belongs to
    pub agent_id: String,

    /// Node the agent was routed to
    pub node_id: NodeId,

    /// When the binding was made
    pub assigned_at: DateTime<Utc>,

    /// Service the agent asked for, reused on reassignment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_service: Option<String>,

    /// Strategy that picked the node; `None` for forced assignments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,

    /// Placed on an explicit node, bypassing selection
    #[serde(default)]
    pub forced: bool,

    /// The node was already at or over capacity when the binding was made
    #[serde(default)]
    pub over_capacity: bool,
}

impl Assignment {
    /// Binding produced by the load balancer
    pub fn selected(
        agent_id: String,
        node_id: NodeId,
        strategy: Strategy,
        required_service: Option<String>,
    ) -> Self {
        Assignment {
            id: Uuid::new_v4(),
            agent_id,
            node_id,
            assigned_at: Utc::now(),
            required_service,
            strategy: Some(strategy),
            forced: false,
            over_capacity: false,
        }
    }

    /// Binding placed on an explicit node
    pub fn forced(agent_id: String, node_id: NodeId, over_capacity: bool) -> Self {
        Assignment {
            id: Uuid::new_v4(),
            agent_id,
            node_id,
            assigned_at: Utc::now(),
            required_service: None,
            strategy: None,
            forced: true,
            over_capacity,
        }
    }

    /// Orphaned when the node is gone or not in `healthy`
    pub fn is_orphaned(&self, healthy: &HashSet<NodeId>) -> bool {
        !healthy.contains(&self.node_id)
    }
}

/// Validate an agent id and return it trimmed
pub fn validate_agent_id(agent_id: &str) -> ClusterResult<String> {
    let trimmed = agent_id.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        return Err(ClusterError::InvalidAgentId(agent_id.to_string()));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_validation() {
        assert_eq!(validate_agent_id("  agent-1 ").unwrap(), "agent-1");
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("   ").is_err());
        assert!(validate_agent_id("bad\nid").is_err());
    }

    #[test]
    fn test_orphan_check() {
        let assignment = Assignment::selected(
            "agent".to_string(),
            NodeId::from("n1"),
            Strategy::LeastLoaded,
            None,
        );
        let mut healthy = HashSet::new();
        assert!(assignment.is_orphaned(&healthy));

        healthy.insert(NodeId::from("n1"));
        assert!(!assignment.is_orphaned(&healthy));
    }

    #[test]
    fn test_forced_assignment_serialization() {
        let assignment = Assignment::forced("agent".to_string(), NodeId::from("n2"), true);
        let json = serde_json::to_value(&assignment).unwrap();

        assert_eq!(json["node_id"], "n2");
        assert_eq!(json["forced"], true);
        assert_eq!(json["over_capacity"], true);
        assert!(json.get("strategy").is_none());

        let back: Assignment = serde_json::from_value(json).unwrap();
        assert_eq!(back, assignment);
    }
}
