//! Node Registry for the cluster
//!
//! The registry owns the id → [`Node`] mapping and is the only place a node is
//! mutated. All writes go through a single `RwLock`; every read hands back
//! copies, so callers can never race the mutation path.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::RwLock;

use crate::error::{ClusterError, ClusterResult};
use crate::node::{Node, NodeId, NodeRole, NodeSpec};

/// In-memory membership table
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a node.
    ///
    /// An existing entry keeps its role and reported load; address, capacity
    /// and services are replaced and the heartbeat is refreshed.
    pub fn register(&self, spec: NodeSpec, now: Instant) -> Node {
        let mut nodes = self.nodes.write();

        if let Some(node) = nodes.get_mut(&spec.id) {
            node.update_from(spec, now);
            debug!("Re-registered node {} at {}", node.id, node.address);
            return node.clone();
        }

        let node = Node::new(spec, now);
        info!(
            "Registered node {} at {} (capacity {})",
            node.id, node.address, node.capacity
        );
        nodes.insert(node.id.clone(), node.clone());
        node
    }

    /// Record a heartbeat with the node's self-reported load
    pub fn heartbeat(&self, id: &NodeId, reported_load: u32, now: Instant) -> ClusterResult<Node> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| ClusterError::NodeNotFound(id.clone()))?;

        node.record_heartbeat(now, reported_load);
        debug!("Heartbeat from {}, load={}/{}", id, node.load, node.capacity);
        Ok(node.clone())
    }

    /// Get a copy of a node
    pub fn get(&self, id: &NodeId) -> ClusterResult<Node> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::NodeNotFound(id.clone()))
    }

    /// Check whether a node is registered
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.read().contains_key(id)
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// True when no node is registered
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Snapshot of every node, sorted by id
    pub fn all(&self) -> Vec<Node> {
        self.snapshot(|_| true)
    }

    /// Snapshot of nodes whose heartbeat is younger than `timeout`
    pub fn healthy(&self, now: Instant, timeout: Duration) -> Vec<Node> {
        self.snapshot(|node| node.is_healthy(now, timeout))
    }

    /// Snapshot of healthy, non-draining nodes with spare capacity
    pub fn available(&self, now: Instant, timeout: Duration) -> Vec<Node> {
        self.snapshot(|node| node.can_accept(now, timeout))
    }

    fn snapshot<F>(&self, filter: F) -> Vec<Node>
    where
        F: Fn(&Node) -> bool,
    {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .values()
            .filter(|node| filter(node))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Remove a node. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &NodeId) -> Option<Node> {
        let removed = self.nodes.write().remove(id);
        if removed.is_some() {
            info!("Removed node {}", id);
        }
        removed
    }

    /// Evict every node whose heartbeat age is at least `eviction_timeout`.
    ///
    /// Returns the evicted ids, sorted.
    pub fn sweep_stale(&self, now: Instant, eviction_timeout: Duration) -> Vec<NodeId> {
        let mut nodes = self.nodes.write();

        let mut evicted: Vec<NodeId> = nodes
            .values()
            .filter(|node| node.heartbeat_age(now) >= eviction_timeout)
            .map(|node| node.id.clone())
            .collect();
        evicted.sort();

        for id in &evicted {
            nodes.remove(id);
            info!("Evicted stale node {}", id);
        }

        evicted
    }

    /// Make `leader` the only node with the leader role.
    ///
    /// Every other node is demoted in the same write, so no reader can observe
    /// two leaders. Fails without touching any role if `leader` is unknown.
    pub fn apply_leader(&self, leader: Option<&NodeId>) -> ClusterResult<()> {
        let mut nodes = self.nodes.write();

        if let Some(id) = leader {
            if !nodes.contains_key(id) {
                return Err(ClusterError::NodeNotFound(id.clone()));
            }
        }

        for node in nodes.values_mut() {
            node.role = if Some(&node.id) == leader {
                NodeRole::Leader
            } else {
                NodeRole::Follower
            };
        }

        Ok(())
    }

    /// Mark a node as draining, or return it to service.
    ///
    /// A draining node stays healthy and keeps its role, but
    /// [`available`](Self::available) no longer lists it.
    pub fn set_draining(&self, id: &NodeId, draining: bool) -> ClusterResult<Node> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| ClusterError::NodeNotFound(id.clone()))?;

        if node.draining != draining {
            node.draining = draining;
            if draining {
                info!("Draining node {}", id);
            } else {
                info!("Node {} back in service", id);
            }
        }
        Ok(node.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRegistration;

    fn spec(id: &str, capacity: i64) -> NodeSpec {
        NodeRegistration::new(id, format!("{}.local:7000", id), capacity)
            .validate()
            .unwrap()
    }

    #[test]
    fn test_register_is_idempotent_upsert() {
        let registry = NodeRegistry::new();
        let now = Instant::now();

        registry.register(spec("n1", 2), now);
        registry.register(spec("n1", 5), now + Duration::from_secs(1));
        registry.register(spec("n1", 3), now + Duration::from_secs(2));

        assert_eq!(registry.len(), 1);
        let node = registry.get(&NodeId::from("n1")).unwrap();
        assert_eq!(node.capacity, 3);
        assert_eq!(node.last_heartbeat, now + Duration::from_secs(2));
    }

    #[test]
    fn test_reregistration_keeps_role_and_load() {
        let registry = NodeRegistry::new();
        let now = Instant::now();
        let id = NodeId::from("n1");

        registry.register(spec("n1", 4), now);
        registry.heartbeat(&id, 3, now).unwrap();
        registry.apply_leader(Some(&id)).unwrap();

        let mut changed = spec("n1", 8);
        changed.address = "elsewhere:9000".to_string();
        let node = registry.register(changed, now);

        assert_eq!(node.role, NodeRole::Leader);
        assert_eq!(node.load, 3);
        assert_eq!(node.address, "elsewhere:9000");
    }

    #[test]
    fn test_heartbeat_unknown_node() {
        let registry = NodeRegistry::new();
        let err = registry
            .heartbeat(&NodeId::from("ghost"), 1, Instant::now())
            .unwrap_err();
        assert_eq!(err, ClusterError::NodeNotFound(NodeId::from("ghost")));
    }

    #[test]
    fn test_heartbeat_updates_load_and_time() {
        let registry = NodeRegistry::new();
        let now = Instant::now();
        let id = NodeId::from("n1");
        registry.register(spec("n1", 4), now);

        let later = now + Duration::from_millis(10);
        registry.heartbeat(&id, 2, later).unwrap();

        let node = registry.get(&id).unwrap();
        assert_eq!(node.load, 2);
        assert!(node.last_heartbeat > now);
    }

    #[test]
    fn test_views() {
        let registry = NodeRegistry::new();
        let start = Instant::now();
        let now = start + Duration::from_secs(20);
        let timeout = Duration::from_secs(10);

        registry.register(spec("stale", 4), start);
        registry.register(spec("b", 2), now);
        registry.register(spec("a", 2), now);
        registry.register(spec("full", 1), now);
        registry.heartbeat(&NodeId::from("full"), 1, now).unwrap();

        let all: Vec<NodeId> = registry.all().into_iter().map(|n| n.id).collect();
        assert_eq!(
            all,
            vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("full"), NodeId::from("stale")]
        );

        let healthy: Vec<_> = registry.healthy(now, timeout).into_iter().map(|n| n.id).collect();
        assert_eq!(healthy, vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("full")]);

        let available: Vec<_> = registry.available(now, timeout).into_iter().map(|n| n.id).collect();
        assert_eq!(available, vec![NodeId::from("a"), NodeId::from("b")]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = NodeRegistry::new();
        registry.register(spec("n1", 1), Instant::now());

        assert!(registry.remove(&NodeId::from("n1")).is_some());
        assert!(registry.remove(&NodeId::from("n1")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_stale() {
        let registry = NodeRegistry::new();
        let start = Instant::now();
        let now = start + Duration::from_secs(60);
        let eviction = Duration::from_secs(30);

        registry.register(spec("old", 1), start);
        registry.register(spec("edge", 1), now - eviction);
        registry.register(spec("fresh", 1), now);

        let evicted = registry.sweep_stale(now, eviction);
        assert_eq!(evicted, vec![NodeId::from("edge"), NodeId::from("old")]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&NodeId::from("fresh")));
    }

    #[test]
    fn test_apply_leader_is_exclusive() {
        let registry = NodeRegistry::new();
        let now = Instant::now();
        for id in ["n1", "n2", "n3"] {
            registry.register(spec(id, 1), now);
        }

        registry.apply_leader(Some(&NodeId::from("n2"))).unwrap();
        registry.apply_leader(Some(&NodeId::from("n3"))).unwrap();

        let leaders: Vec<_> = registry.all().into_iter().filter(|n| n.is_leader()).collect();
        assert_eq!(leaders.len(), 1);
        assert_eq!(leaders[0].id, NodeId::from("n3"));

        // Unknown leader leaves roles untouched
        assert!(registry.apply_leader(Some(&NodeId::from("n9"))).is_err());
        assert!(registry.get(&NodeId::from("n3")).unwrap().is_leader());

        registry.apply_leader(None).unwrap();
        assert!(registry.all().iter().all(|n| !n.is_leader()));
    }

    #[test]
    fn test_draining_node_leaves_available_only() {
        let registry = NodeRegistry::new();
        let now = Instant::now();
        let timeout = Duration::from_secs(10);
        let id = NodeId::from("n1");
        registry.register(spec("n1", 2), now);
        registry.register(spec("n2", 2), now);
        registry.apply_leader(Some(&id)).unwrap();

        let node = registry.set_draining(&id, true).unwrap();
        assert!(node.draining);
        assert!(node.is_leader());

        let available: Vec<_> = registry.available(now, timeout).into_iter().map(|n| n.id).collect();
        assert_eq!(available, vec![NodeId::from("n2")]);
        assert_eq!(registry.healthy(now, timeout).len(), 2);

        // Survives re-registration
        registry.register(spec("n1", 4), now);
        assert!(registry.get(&id).unwrap().draining);

        registry.set_draining(&id, false).unwrap();
        assert_eq!(registry.available(now, timeout).len(), 2);
    }

    #[test]
    fn test_set_draining_unknown_node() {
        let registry = NodeRegistry::new();
        let err = registry
            .set_draining(&NodeId::from("ghost"), true)
            .unwrap_err();
        assert_eq!(err, ClusterError::NodeNotFound(NodeId::from("ghost")));
    }
}
