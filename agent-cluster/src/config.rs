//! Configuration module for the cluster coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::Strategy;
use crate::error::{ClusterError, ClusterResult};

/// Default heartbeat timeout in seconds
pub const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 30;

/// Default eviction timeout in seconds
pub const DEFAULT_EVICTION_TIMEOUT: u64 = 90;

/// Default sweep interval in seconds
pub const DEFAULT_SWEEP_INTERVAL: u64 = 10;

/// Default number of leadership changes kept in memory
pub const DEFAULT_LEADER_HISTORY_LIMIT: usize = 64;

/// Default capacity of the cluster event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Coordinator configuration builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Heartbeat age after which a node is unhealthy
    pub heartbeat_timeout: Duration,

    /// Heartbeat age after which a node is removed entirely
    pub eviction_timeout: Duration,

    /// Background sweep period
    pub sweep_interval: Duration,

    /// Strategy used when an assignment request names none
    pub default_strategy: Strategy,

    /// Leadership changes retained for `leadership_history`
    pub leader_history_limit: usize,

    /// Buffered events per subscriber before old events are dropped
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT),
            eviction_timeout: Duration::from_secs(DEFAULT_EVICTION_TIMEOUT),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL),
            default_strategy: Strategy::default(),
            leader_history_limit: DEFAULT_LEADER_HISTORY_LIMIT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl CoordinatorConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set heartbeat timeout
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set eviction timeout
    pub fn eviction_timeout(mut self, timeout: Duration) -> Self {
        self.eviction_timeout = timeout;
        self
    }

    /// Set sweep interval
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set default strategy
    pub fn default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Set leadership history limit
    pub fn leader_history_limit(mut self, limit: usize) -> Self {
        self.leader_history_limit = limit;
        self
    }

    /// Set event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> ClusterResult<Self> {
        if self.heartbeat_timeout.is_zero() {
            return Err(ClusterError::ConfigurationError(
                "heartbeat timeout must be greater than zero".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ClusterError::ConfigurationError(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        if self.eviction_timeout < self.heartbeat_timeout {
            return Err(ClusterError::ConfigurationError(format!(
                "eviction timeout ({:?}) must not be shorter than heartbeat timeout ({:?})",
                self.eviction_timeout, self.heartbeat_timeout
            )));
        }

        if self.leader_history_limit == 0 || self.event_capacity == 0 {
            return Err(ClusterError::ConfigurationError(
                "leader history limit and event capacity must be positive".to_string(),
            ));
        }

        if self.sweep_interval > self.heartbeat_timeout {
            log::warn!(
                "Sweep interval {:?} exceeds heartbeat timeout {:?}; stale leaders will be noticed late",
                self.sweep_interval,
                self.heartbeat_timeout
            );
        }

        Ok(self)
    }
}
