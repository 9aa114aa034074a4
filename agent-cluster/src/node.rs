//! Node module for cluster member identification and liveness state.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};

/// Longest accepted node id, in bytes
pub const MAX_NODE_ID_LEN: usize = 128;

/// Unique identifier for a node in the cluster
///
/// Ordering is plain lexicographic string ordering; the election rule and the
/// round-robin cursor both depend on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Parse and validate a node id
    pub fn parse(id: impl Into<String>) -> ClusterResult<Self> {
        let id = id.into();
        let well_formed = !id.is_empty()
            && id.len() <= MAX_NODE_ID_LEN
            && !id.chars().any(|c| c.is_whitespace() || c.is_control());

        if well_formed {
            Ok(NodeId(id))
        } else {
            Err(ClusterError::InvalidNodeId(id))
        }
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Lookup conversions. They do not validate: a malformed id simply never
// matches anything, because only `NodeSpec` (validated) can insert.
impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Coordinator-of-record for the cluster
    Leader,

    /// Any other member
    Follower,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "leader"),
            NodeRole::Follower => write!(f, "follower"),
        }
    }
}

/// Node health status, derived from heartbeat age
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Heartbeat seen within the timeout
    Healthy,

    /// Heartbeat older than the timeout
    Unhealthy,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Healthy => write!(f, "healthy"),
            NodeStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Registration request as it arrives from a caller.
///
/// `capacity` is signed so that a negative value can be reported as
/// [`ClusterError::InvalidCapacity`] instead of failing to decode. Accepted
/// capacities are `0..=u32::MAX`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Requested node id
    pub id: String,

    /// Network endpoint of the node
    pub address: String,

    /// Maximum concurrent agent assignments
    pub capacity: i64,

    /// Workloads the node can run
    #[serde(default)]
    pub services: Vec<String>,
}

impl NodeRegistration {
    /// Create a registration without services
    pub fn new(id: impl Into<String>, address: impl Into<String>, capacity: i64) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            capacity,
            services: Vec::new(),
        }
    }

    /// Add advertised services
    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.extend(services.into_iter().map(Into::into));
        self
    }

    /// Validate into a [`NodeSpec`] the registry accepts
    pub fn validate(&self) -> ClusterResult<NodeSpec> {
        let id = NodeId::parse(self.id.clone())?;
        let capacity = u32::try_from(self.capacity)
            .map_err(|_| ClusterError::InvalidCapacity(self.capacity))?;

        Ok(NodeSpec {
            id,
            address: self.address.clone(),
            capacity,
            services: self
                .services
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }
}

/// Validated registration data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Node id
    pub id: NodeId,
    /// Network endpoint
    pub address: String,
    /// Maximum concurrent assignments
    pub capacity: u32,
    /// Advertised services
    pub services: BTreeSet<String>,
}

/// One cluster member
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique node identifier
    pub id: NodeId,

    /// Network endpoint
    pub address: String,

    /// Maximum concurrent agent assignments
    pub capacity: u32,

    /// Agents currently running on the node, as reported by the node itself
    pub load: u32,

    /// Last heartbeat (or registration) time
    pub last_heartbeat: Instant,

    /// Workloads the node can run
    pub services: BTreeSet<String>,

    /// Role decided by the coordinator's election
    pub role: NodeRole,

    /// Draining nodes keep their agents but take no new ones
    pub draining: bool,

    /// Wall-clock time of the first registration
    pub registered_at: DateTime<Utc>,
}

impl Node {
    /// Create a follower node from a validated spec
    pub fn new(spec: NodeSpec, now: Instant) -> Self {
        Node {
            id: spec.id,
            address: spec.address,
            capacity: spec.capacity,
            load: 0,
            last_heartbeat: now,
            services: spec.services,
            role: NodeRole::Follower,
            draining: false,
            registered_at: Utc::now(),
        }
    }

    /// Time elapsed since the last heartbeat. A heartbeat later than `now` counts as zero.
    pub fn heartbeat_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    /// Check whether the last heartbeat is younger than `timeout`
    pub fn is_healthy(&self, now: Instant, timeout: Duration) -> bool {
        self.heartbeat_age(now) < timeout
    }

    /// Derived health status
    pub fn status(&self, now: Instant, timeout: Duration) -> NodeStatus {
        if self.is_healthy(now, timeout) {
            NodeStatus::Healthy
        } else {
            NodeStatus::Unhealthy
        }
    }

    /// Fraction of capacity in use. A zero-capacity node is fully loaded.
    pub fn load_factor(&self) -> f64 {
        if self.capacity == 0 {
            1.0
        } else {
            self.load as f64 / self.capacity as f64
        }
    }

    /// Remaining assignment slots
    pub fn headroom(&self) -> u32 {
        self.capacity.saturating_sub(self.load)
    }

    /// Healthy, not draining and below capacity
    pub fn can_accept(&self, now: Instant, timeout: Duration) -> bool {
        self.is_healthy(now, timeout) && !self.draining && self.load < self.capacity
    }

    /// Check if the node advertises a service
    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains(service)
    }

    /// Check if the node currently holds leadership
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }

    /// Record a heartbeat. The timestamp never moves backwards.
    pub(crate) fn record_heartbeat(&mut self, now: Instant, load: u32) {
        self.touch(now);
        self.load = load;
    }

    /// Apply a re-registration, keeping role, load, drain flag and first registration time
    pub(crate) fn update_from(&mut self, spec: NodeSpec, now: Instant) {
        self.address = spec.address;
        self.capacity = spec.capacity;
        self.services = spec.services;
        self.touch(now);
    }

    fn touch(&mut self, now: Instant) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }

    /// Serializable snapshot for callers outside the process
    pub fn view(&self, now: Instant, timeout: Duration) -> NodeView {
        NodeView {
            id: self.id.clone(),
            address: self.address.clone(),
            capacity: self.capacity,
            load: self.load,
            load_factor: self.load_factor(),
            services: self.services.iter().cloned().collect(),
            role: self.role,
            draining: self.draining,
            status: self.status(now, timeout),
            heartbeat_age_ms: self.heartbeat_age(now).as_millis() as u64,
            registered_at: self.registered_at,
        }
    }
}

/// Wire representation of a [`Node`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    /// Node id
    pub id: NodeId,
    /// Network endpoint
    pub address: String,
    /// Maximum concurrent assignments
    pub capacity: u32,
    /// Reported load
    pub load: u32,
    /// `load / capacity`
    pub load_factor: f64,
    /// Advertised services
    pub services: Vec<String>,
    /// Current role
    pub role: NodeRole,
    /// Takes no new assignments
    #[serde(default)]
    pub draining: bool,
    /// Derived health
    pub status: NodeStatus,
    /// Milliseconds since the last heartbeat
    pub heartbeat_age_ms: u64,
    /// First registration time
    pub registered_at: DateTime<Utc>,
}
