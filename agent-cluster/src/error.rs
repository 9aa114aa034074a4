//! Error types for the agent-cluster crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::NodeId;

/// Main error type for cluster coordination
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// Node not found in the registry
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// No node qualifies for the requested assignment
    #[error("No nodes available")]
    NoAvailableNodes,

    /// Registration capacity is negative or does not fit in a `u32`
    #[error("Invalid capacity: {0} (expected 0..={})", u32::MAX)]
    InvalidCapacity(i64),

    /// Node id is empty, too long or contains whitespace/control characters
    #[error("Invalid node ID: {0:?}")]
    InvalidNodeId(String),

    /// Agent id is empty or malformed
    #[error("Invalid agent ID: {0:?}")]
    InvalidAgentId(String),

    /// No assignment recorded for the agent
    #[error("Assignment not found for agent: {0}")]
    AssignmentNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Type alias for Result with ClusterError
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Serializable discriminant of [`ClusterError`], used on the request/response boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ClusterError::NodeNotFound`]
    NodeNotFound,
    /// See [`ClusterError::NoAvailableNodes`]
    NoAvailableNodes,
    /// See [`ClusterError::InvalidCapacity`]
    InvalidCapacity,
    /// See [`ClusterError::InvalidNodeId`]
    InvalidNodeId,
    /// See [`ClusterError::InvalidAgentId`]
    InvalidAgentId,
    /// See [`ClusterError::AssignmentNotFound`]
    AssignmentNotFound,
    /// See [`ClusterError::ConfigurationError`]
    Configuration,
    /// The request itself could not be decoded
    BadRequest,
}

impl ClusterError {
    /// Kind of this error as exposed to callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::NodeNotFound(_) => ErrorKind::NodeNotFound,
            ClusterError::NoAvailableNodes => ErrorKind::NoAvailableNodes,
            ClusterError::InvalidCapacity(_) => ErrorKind::InvalidCapacity,
            ClusterError::InvalidNodeId(_) => ErrorKind::InvalidNodeId,
            ClusterError::InvalidAgentId(_) => ErrorKind::InvalidAgentId,
            ClusterError::AssignmentNotFound(_) => ErrorKind::AssignmentNotFound,
            ClusterError::ConfigurationError(_) => ErrorKind::Configuration,
        }
    }

    /// Returns true if the caller may succeed by retrying later without changing the request.
    ///
    /// The core never retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::NoAvailableNodes)
    }
}
