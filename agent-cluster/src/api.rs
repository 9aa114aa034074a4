//! Transport-independent request/response contract.
//!
//! Requests are JSON objects tagged by `op`; responses are tagged by `status`
//! and, when successful, by `result`. Any transport that can move a line of
//! JSON can drive a coordinator through [`ClusterCoordinator::handle_json`].

use serde::{Deserialize, Serialize};

use crate::assignment::Assignment;
use crate::balancer::Strategy;
use crate::coordinator::{ClusterCoordinator, ClusterHealth, ClusterStats, NodeFilter};
use crate::election::LeadershipChange;
use crate::error::{ClusterResult, ErrorKind};
use crate::node::{NodeId, NodeRegistration, NodeView};

/// Operation sent to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Register or re-register a node
    Register(NodeRegistration),
    /// Liveness and load report
    Heartbeat {
        /// Reporting node
        id: String,
        /// Current load
        load: u32,
    },
    /// List nodes
    ListNodes {
        /// Which nodes to include
        #[serde(default)]
        filter: NodeFilter,
    },
    /// Place an agent through the load balancer
    Assign {
        /// Agent to place
        agent_id: String,
        /// Only consider nodes advertising this service
        #[serde(default)]
        required_service: Option<String>,
        /// Override the configured default strategy
        #[serde(default)]
        strategy: Option<Strategy>,
    },
    /// Place an agent on a named node
    AssignTo {
        /// Agent to place
        agent_id: String,
        /// Target node
        node_id: String,
    },
    /// Cluster statistics
    Stats,
    /// Current leader id
    Leader,
    /// Assignments whose node is gone or unhealthy
    Orphans,
    /// All assignments
    Assignments,
    /// Deregister a node
    Remove {
        /// Node to remove
        id: String,
    },
    /// Stop placing new agents on a node
    Drain {
        /// Node to drain
        id: String,
    },
    /// Return a drained node to service
    Undrain {
        /// Node to return
        id: String,
    },
    /// Drop an assignment
    Release {
        /// Agent to release
        agent_id: String,
    },
    /// Move an assignment to a new node
    Reassign {
        /// Agent to move
        agent_id: String,
        /// Override the configured default strategy
        #[serde(default)]
        strategy: Option<Strategy>,
    },
    /// Run the election rule now
    Elect,
    /// Recent leadership changes
    History,
    /// Derived cluster condition
    Health,
}

/// Payload of a successful response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reply {
    /// A single node
    Node {
        /// The node
        node: NodeView,
    },
    /// A list of nodes
    Nodes {
        /// The nodes, sorted by id
        nodes: Vec<NodeView>,
    },
    /// Outcome of a deregistration
    Removed {
        /// The node that was removed, if it existed
        node: Option<NodeView>,
    },
    /// A single assignment
    Assignment {
        /// The assignment
        assignment: Assignment,
    },
    /// A list of assignments
    Assignments {
        /// The assignments, sorted by agent id
        assignments: Vec<Assignment>,
    },
    /// Cluster statistics
    Stats {
        /// The statistics
        stats: ClusterStats,
    },
    /// Leader id
    Leader {
        /// Recorded leader, if any
        leader: Option<NodeId>,
    },
    /// Leadership history, oldest first
    History {
        /// Recorded changes
        history: Vec<LeadershipChange>,
    },
    /// Cluster condition
    Health {
        /// Derived condition
        health: ClusterHealth,
    },
}

/// Response to a [`Request`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The operation succeeded
    Ok(Reply),
    /// The operation failed and changed nothing
    Error {
        /// Machine-readable error class
        kind: ErrorKind,
        /// Human-readable description
        message: String,
    },
}

impl Response {
    /// Error response for a request that could not be decoded
    pub fn bad_request(message: impl Into<String>) -> Self {
        Response::Error {
            kind: ErrorKind::BadRequest,
            message: message.into(),
        }
    }

    /// True for [`Response::Ok`]
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl From<ClusterResult<Reply>> for Response {
    fn from(result: ClusterResult<Reply>) -> Self {
        match result {
            Ok(reply) => Response::Ok(reply),
            Err(e) => Response::Error {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

impl ClusterCoordinator {
    /// Execute one request
    pub fn handle(&self, request: Request) -> Response {
        self.dispatch(request).into()
    }

    /// Decode a JSON request, execute it and encode the response.
    ///
    /// Undecodable input yields a `bad_request` error response rather than an
    /// `Err`; only encoding the response can fail.
    pub fn handle_json(&self, line: &str) -> serde_json::Result<String> {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request),
            Err(e) => Response::bad_request(e.to_string()),
        };
        serde_json::to_string(&response)
    }

    fn dispatch(&self, request: Request) -> ClusterResult<Reply> {
        let reply = match request {
            Request::Register(registration) => {
                let node = self.register_node(&registration)?;
                Reply::Node {
                    node: self.view(&node),
                }
            }
            Request::Heartbeat { id, load } => {
                let node = self.heartbeat(&NodeId::from(id), load)?;
                Reply::Node {
                    node: self.view(&node),
                }
            }
            Request::ListNodes { filter } => Reply::Nodes {
                nodes: self.node_views(filter),
            },
            Request::Assign {
                agent_id,
                required_service,
                strategy,
            } => Reply::Assignment {
                assignment: self.assign(&agent_id, required_service.as_deref(), strategy)?,
            },
            Request::AssignTo { agent_id, node_id } => Reply::Assignment {
                assignment: self.assign_to(&agent_id, &NodeId::from(node_id))?,
            },
            Request::Stats => Reply::Stats {
                stats: self.stats(),
            },
            Request::Leader => Reply::Leader {
                leader: self.leader(),
            },
            Request::Orphans => Reply::Assignments {
                assignments: self.orphans(),
            },
            Request::Assignments => Reply::Assignments {
                assignments: self.assignments(),
            },
            Request::Remove { id } => {
                let removed = self.remove_node(&NodeId::from(id))?;
                Reply::Removed {
                    node: removed.map(|node| self.view(&node)),
                }
            }
            Request::Drain { id } => {
                let node = self.drain(&NodeId::from(id))?;
                Reply::Node {
                    node: self.view(&node),
                }
            }
            Request::Undrain { id } => {
                let node = self.undrain(&NodeId::from(id))?;
                Reply::Node {
                    node: self.view(&node),
                }
            }
            Request::Release { agent_id } => Reply::Assignment {
                assignment: self.release(&agent_id)?,
            },
            Request::Reassign { agent_id, strategy } => Reply::Assignment {
                assignment: self.reassign(&agent_id, strategy)?,
            },
            Request::Elect => Reply::Leader {
                leader: self.elect_leader()?,
            },
            Request::History => Reply::History {
                history: self.leadership_history(),
            },
            Request::Health => Reply::Health {
                health: self.cluster_health(),
            },
        };

        Ok(reply)
    }
}
