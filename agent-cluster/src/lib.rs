//! Agent Cluster
//!
//! Membership, leader election and load-balanced agent placement for a fleet
//! of worker nodes. Nodes register and heartbeat into a shared registry; the
//! coordinator elects the lowest-id healthy node as leader, routes agents to
//! nodes with one of several balancing strategies, and sweeps out nodes that
//! stop reporting.
//!
//! Leadership is decided locally without a quorum. Two coordinators that see
//! different membership can each elect a leader.

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]
#![warn(missing_docs)]

pub mod api;
pub mod assignment;
pub mod balancer;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod election;
pub mod error;
pub mod node;
pub mod registry;

// Test helpers, also used by the integration tests
#[doc(hidden)]
pub mod testing;

pub use api::{Reply, Request, Response};
pub use assignment::Assignment;
pub use balancer::{LoadBalancer, Strategy};
pub use clock::{Clock, SystemClock};
pub use config::CoordinatorConfig;
pub use coordinator::{
    ClusterCoordinator, ClusterEvent, ClusterHealth, ClusterStats, NodeFilter, SweepReport,
    SweeperHandle,
};
pub use election::{ElectionReason, LeadershipChange};
pub use error::{ClusterError, ClusterResult, ErrorKind};
pub use node::{Node, NodeId, NodeRegistration, NodeRole, NodeStatus, NodeView};
pub use registry::NodeRegistry;
