//! Cluster Coordinator
//!
//! The coordinator is the entry point for callers. It owns the assignment table
//! and the recorded leader, delegates membership to the [`NodeRegistry`] and
//! node choice to the [`LoadBalancer`], and runs the periodic sweep that evicts
//! stale nodes and replaces a stale leader.
//!
//! Locking: coordinator state is behind one mutex that is always taken before
//! the registry lock. The registry never calls back into the coordinator.
//!
//! Several coordinators may share one registry. Each keeps its own recorded
//! leader, and the role flags in the registry belong to whichever coordinator
//! ran an election last.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::assignment::{validate_agent_id, Assignment};
use crate::balancer::{LoadBalancer, Strategy};
use crate::clock::{Clock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::election::{choose_leader, election_trigger, ElectionReason, LeadershipChange};
use crate::error::{ClusterError, ClusterResult};
use crate::node::{Node, NodeId, NodeRegistration, NodeView};
use crate::registry::NodeRegistry;

/// Which nodes `list_nodes` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeFilter {
    /// Every registered node
    #[default]
    All,
    /// Nodes with a recent heartbeat
    Healthy,
    /// Healthy, non-draining nodes with spare capacity
    Available,
}

/// Overall cluster condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterHealth {
    /// At least one node and every node is healthy
    Healthy,
    /// Some nodes are unhealthy
    Degraded,
    /// No healthy node
    Unavailable,
}

impl ClusterHealth {
    fn from_counts(node_count: usize, healthy_count: usize) -> Self {
        if healthy_count == 0 {
            ClusterHealth::Unavailable
        } else if healthy_count < node_count {
            ClusterHealth::Degraded
        } else {
            ClusterHealth::Healthy
        }
    }
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterHealth::Healthy => write!(f, "healthy"),
            ClusterHealth::Degraded => write!(f, "degraded"),
            ClusterHealth::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Point-in-time cluster statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStats {
    /// Registered nodes
    pub node_count: usize,
    /// Nodes with a recent heartbeat
    pub healthy_count: usize,
    /// Healthy, non-draining nodes with spare capacity
    pub available_count: usize,
    /// Sum of capacities over all nodes
    pub total_capacity: u64,
    /// Sum of reported loads over all nodes
    pub total_load: u64,
    /// `total_load / total_capacity`, zero for an empty cluster
    pub utilization: f64,
    /// Reported load per node
    pub per_node_load: BTreeMap<NodeId, u32>,
    /// Recorded leader
    pub leader_id: Option<NodeId>,
    /// Recorded assignments
    pub assignment_count: usize,
    /// Assignments whose node is gone or unhealthy
    pub orphan_count: usize,
    /// Derived cluster condition
    pub health: ClusterHealth,
}

/// Notification published by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// A new node id registered
    NodeJoined {
        /// Joining node
        node_id: NodeId,
    },
    /// A node was dropped by the sweep
    NodeEvicted {
        /// Evicted node
        node_id: NodeId,
    },
    /// A node was deregistered
    NodeRemoved {
        /// Removed node
        node_id: NodeId,
    },
    /// A node started or stopped draining
    NodeDrainChanged {
        /// Affected node
        node_id: NodeId,
        /// New drain flag
        draining: bool,
    },
    /// Leadership moved
    LeaderChanged {
        /// The transition
        change: LeadershipChange,
    },
    /// An assignment lost its node
    AssignmentOrphaned {
        /// The orphaned assignment
        assignment: Assignment,
    },
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Nodes removed for exceeding the eviction timeout
    pub evicted: Vec<NodeId>,
    /// Election result, when one changed the leader
    pub leader_change: Option<LeadershipChange>,
    /// Assignments that became orphans during this pass
    pub new_orphans: Vec<Assignment>,
}

impl SweepReport {
    /// True when the pass changed nothing
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.leader_change.is_none() && self.new_orphans.is_empty()
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    leader: Option<NodeId>,
    assignments: HashMap<String, Assignment>,
    reported_orphans: HashSet<String>,
    history: VecDeque<LeadershipChange>,
}

/// Coordinates membership, leadership and agent placement
pub struct ClusterCoordinator {
    config: CoordinatorConfig,
    registry: Arc<NodeRegistry>,
    balancer: LoadBalancer,
    clock: Arc<dyn Clock>,
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<ClusterEvent>,
}

impl fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("config", &self.config)
            .field("nodes", &self.registry.len())
            .field("leader", &self.state.lock().leader)
            .finish()
    }
}

impl ClusterCoordinator {
    /// Create a coordinator over `registry` using the system clock
    pub fn new(config: CoordinatorConfig, registry: Arc<NodeRegistry>) -> ClusterResult<Self> {
        Self::with_clock(config, registry, Arc::new(SystemClock))
    }

    /// Create a coordinator with an explicit time source
    pub fn with_clock(
        config: CoordinatorConfig,
        registry: Arc<NodeRegistry>,
        clock: Arc<dyn Clock>,
    ) -> ClusterResult<Self> {
        let config = config.build()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(ClusterCoordinator {
            config,
            registry,
            balancer: LoadBalancer::new(),
            clock,
            state: Mutex::new(CoordinatorState::default()),
            events,
        })
    }

    /// Replace the load balancer, e.g. with a seeded one
    pub fn with_balancer(mut self, balancer: LoadBalancer) -> Self {
        self.balancer = balancer;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Shared membership table
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Receive cluster events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Register or re-register a node.
    ///
    /// A returning node keeps whatever role the registry holds for it; only an
    /// election rewrites roles. When no leader is recorded an election runs
    /// immediately.
    pub fn register_node(&self, registration: &NodeRegistration) -> ClusterResult<Node> {
        let spec = registration.validate()?;
        let now = self.clock.now();

        let mut state = self.state.lock();
        let is_new = !self.registry.contains(&spec.id);
        let node = self.registry.register(spec, now);

        if is_new {
            self.publish(ClusterEvent::NodeJoined {
                node_id: node.id.clone(),
            });
        }

        if state.leader.is_none() {
            self.run_election(&mut state, ElectionReason::NoLeader, now)?;
        }

        self.registry.get(&node.id)
    }

    /// Record a heartbeat carrying the node's current load
    pub fn heartbeat(&self, id: &NodeId, load: u32) -> ClusterResult<Node> {
        self.registry.heartbeat(id, load, self.clock.now())
    }

    /// Look up one node
    pub fn node(&self, id: &NodeId) -> ClusterResult<Node> {
        self.registry.get(id)
    }

    /// Snapshot of nodes matching `filter`, sorted by id
    pub fn list_nodes(&self, filter: NodeFilter) -> Vec<Node> {
        let now = self.clock.now();
        let timeout = self.config.heartbeat_timeout;
        match filter {
            NodeFilter::All => self.registry.all(),
            NodeFilter::Healthy => self.registry.healthy(now, timeout),
            NodeFilter::Available => self.registry.available(now, timeout),
        }
    }

    /// Like [`list_nodes`](Self::list_nodes) but rendered for the wire
    pub fn node_views(&self, filter: NodeFilter) -> Vec<NodeView> {
        self.list_nodes(filter).iter().map(|node| self.view(node)).collect()
    }

    /// Render a node with its status as of now
    pub fn view(&self, node: &Node) -> NodeView {
        node.view(self.clock.now(), self.config.heartbeat_timeout)
    }

    /// Stop placing new agents on a node.
    ///
    /// Existing assignments stay put and are not reported as orphans, and the
    /// node keeps its role and stays eligible for leadership.
    pub fn drain(&self, id: &NodeId) -> ClusterResult<Node> {
        self.set_draining(id, true)
    }

    /// Return a drained node to service
    pub fn undrain(&self, id: &NodeId) -> ClusterResult<Node> {
        self.set_draining(id, false)
    }

    fn set_draining(&self, id: &NodeId, draining: bool) -> ClusterResult<Node> {
        let _state = self.state.lock();
        let before = self.registry.get(id)?;
        let node = self.registry.set_draining(id, draining)?;
        if before.draining != draining {
            self.publish(ClusterEvent::NodeDrainChanged {
                node_id: id.clone(),
                draining,
            });
        }
        Ok(node)
    }

    /// Deregister a node. Removing an unknown id is a no-op.
    pub fn remove_node(&self, id: &NodeId) -> ClusterResult<Option<Node>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let removed = self.registry.remove(id);
        if removed.is_some() {
            self.publish(ClusterEvent::NodeRemoved { node_id: id.clone() });
            if state.leader.as_ref() == Some(id) {
                self.run_election(&mut state, ElectionReason::LeaderRemoved, now)?;
            }
        }

        Ok(removed)
    }

    /// Place an agent on a node chosen by `strategy`, or the configured default.
    ///
    /// Candidates are the available nodes, restricted to those advertising
    /// `required_service` when one is given. Replaces any earlier assignment
    /// of the same agent.
    pub fn assign(
        &self,
        agent_id: &str,
        required_service: Option<&str>,
        strategy: Option<Strategy>,
    ) -> ClusterResult<Assignment> {
        let agent_id = validate_agent_id(agent_id)?;
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let service = required_service.map(str::trim).filter(|s| !s.is_empty());
        let now = self.clock.now();

        let mut state = self.state.lock();
        let candidates = self.candidates(now, service);
        let node = self.balancer.select(&candidates, strategy, service)?;

        let assignment = Assignment::selected(
            agent_id,
            node.id.clone(),
            strategy,
            service.map(str::to_string),
        );
        debug!(
            "Assigned agent {} to node {} ({})",
            assignment.agent_id, assignment.node_id, strategy
        );
        Ok(self.record(&mut state, assignment))
    }

    /// Place an agent on a specific node, bypassing selection.
    ///
    /// The node only has to be registered; the assignment is flagged as
    /// forced, and as over capacity when the node was already full.
    pub fn assign_to(&self, agent_id: &str, node_id: &NodeId) -> ClusterResult<Assignment> {
        let agent_id = validate_agent_id(agent_id)?;
        let now = self.clock.now();

        let mut state = self.state.lock();
        let node = self.registry.get(node_id)?;
        let over_capacity = node.load >= node.capacity;

        if over_capacity {
            warn!(
                "Forced assignment of {} onto node {} at load {}/{}",
                agent_id, node.id, node.load, node.capacity
            );
        }
        if !node.is_healthy(now, self.config.heartbeat_timeout) {
            warn!("Forced assignment of {} onto unhealthy node {}", agent_id, node.id);
        }
        if node.draining {
            warn!("Forced assignment of {} onto draining node {}", agent_id, node.id);
        }

        let assignment = Assignment::forced(agent_id, node.id, over_capacity);
        Ok(self.record(&mut state, assignment))
    }

    /// Move an existing assignment to a freshly selected node.
    ///
    /// The current node is avoided whenever another candidate qualifies, and
    /// draining nodes never qualify. The original required service is kept.
    pub fn reassign(&self, agent_id: &str, strategy: Option<Strategy>) -> ClusterResult<Assignment> {
        let agent_id = validate_agent_id(agent_id)?;
        let strategy = strategy.unwrap_or(self.config.default_strategy);
        let now = self.clock.now();

        let mut state = self.state.lock();
        let current = state
            .assignments
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| ClusterError::AssignmentNotFound(agent_id.clone()))?;
        let service = current.required_service.as_deref();

        let mut candidates = self.candidates(now, service);
        if candidates.iter().any(|node| node.id != current.node_id) {
            candidates.retain(|node| node.id != current.node_id);
        }
        let node = self.balancer.select(&candidates, strategy, service)?;

        info!(
            "Reassigned agent {} from {} to {}",
            agent_id, current.node_id, node.id
        );
        let assignment =
            Assignment::selected(agent_id, node.id.clone(), strategy, current.required_service);
        Ok(self.record(&mut state, assignment))
    }

    /// Drop the assignment of an agent
    pub fn release(&self, agent_id: &str) -> ClusterResult<Assignment> {
        let agent_id = validate_agent_id(agent_id)?;
        let mut state = self.state.lock();
        state.reported_orphans.remove(&agent_id);
        state
            .assignments
            .remove(&agent_id)
            .ok_or(ClusterError::AssignmentNotFound(agent_id))
    }

    /// Current assignment of an agent
    pub fn assignment(&self, agent_id: &str) -> Option<Assignment> {
        self.state.lock().assignments.get(agent_id.trim()).cloned()
    }

    /// Every assignment, sorted by agent id
    pub fn assignments(&self) -> Vec<Assignment> {
        let mut all: Vec<Assignment> = self.state.lock().assignments.values().cloned().collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Assignments whose node is missing or unhealthy, sorted by agent id
    pub fn orphans(&self) -> Vec<Assignment> {
        let now = self.clock.now();
        let state = self.state.lock();
        self.find_orphans(&state, now)
    }

    /// Recorded leader
    pub fn leader(&self) -> Option<NodeId> {
        self.state.lock().leader.clone()
    }

    /// Full node record of the leader
    pub fn leader_node(&self) -> Option<Node> {
        let state = self.state.lock();
        let leader = state.leader.as_ref()?;
        self.registry.get(leader).ok()
    }

    /// Recent leadership changes, oldest first
    pub fn leadership_history(&self) -> Vec<LeadershipChange> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Run the election rule now.
    ///
    /// Unlike the automatic triggers this may hand leadership to a lower id
    /// that rejoined while another node was leading.
    pub fn elect_leader(&self) -> ClusterResult<Option<NodeId>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.run_election(&mut state, ElectionReason::Explicit, now)?;
        Ok(state.leader.clone())
    }

    /// Derived cluster condition
    pub fn cluster_health(&self) -> ClusterHealth {
        let now = self.clock.now();
        let all = self.registry.all();
        let healthy = all
            .iter()
            .filter(|node| node.is_healthy(now, self.config.heartbeat_timeout))
            .count();
        ClusterHealth::from_counts(all.len(), healthy)
    }

    /// Compute cluster statistics
    pub fn stats(&self) -> ClusterStats {
        let now = self.clock.now();
        let timeout = self.config.heartbeat_timeout;
        let state = self.state.lock();
        let nodes = self.registry.all();

        let healthy_count = nodes.iter().filter(|n| n.is_healthy(now, timeout)).count();
        let available_count = nodes.iter().filter(|n| n.can_accept(now, timeout)).count();
        let total_capacity: u64 = nodes.iter().map(|n| u64::from(n.capacity)).sum();
        let total_load: u64 = nodes.iter().map(|n| u64::from(n.load)).sum();
        let utilization = if total_capacity == 0 {
            0.0
        } else {
            total_load as f64 / total_capacity as f64
        };

        ClusterStats {
            node_count: nodes.len(),
            healthy_count,
            available_count,
            total_capacity,
            total_load,
            utilization,
            per_node_load: nodes.iter().map(|n| (n.id.clone(), n.load)).collect(),
            leader_id: state.leader.clone(),
            assignment_count: state.assignments.len(),
            orphan_count: self.find_orphans(&state, now).len(),
            health: ClusterHealth::from_counts(nodes.len(), healthy_count),
        }
    }

    /// Run one sweep pass: evict stale nodes, replace a stale or missing
    /// leader and report assignments that became orphans.
    pub fn sweep_once(&self) -> ClusterResult<SweepReport> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let evicted = self.registry.sweep_stale(now, self.config.eviction_timeout);
        for id in &evicted {
            self.publish(ClusterEvent::NodeEvicted { node_id: id.clone() });
        }

        let leader_evicted = state
            .leader
            .as_ref()
            .map_or(false, |leader| evicted.contains(leader));
        let reason = if leader_evicted {
            Some(ElectionReason::LeaderEvicted)
        } else {
            election_trigger(
                state.leader.as_ref(),
                &self.registry.all(),
                now,
                self.config.heartbeat_timeout,
            )
        };

        let leader_change = match reason {
            Some(reason) => self.run_election(&mut state, reason, now)?,
            None => None,
        };

        let orphans = self.find_orphans(&state, now);
        let new_orphans: Vec<Assignment> = orphans
            .iter()
            .filter(|a| !state.reported_orphans.contains(&a.agent_id))
            .cloned()
            .collect();
        for assignment in &new_orphans {
            warn!(
                "Assignment of agent {} orphaned: node {} is gone or unhealthy",
                assignment.agent_id, assignment.node_id
            );
            self.publish(ClusterEvent::AssignmentOrphaned {
                assignment: assignment.clone(),
            });
        }
        state.reported_orphans = orphans.into_iter().map(|a| a.agent_id).collect();

        Ok(SweepReport {
            evicted,
            leader_change,
            new_orphans,
        })
    }

    /// Spawn the periodic sweep on the current tokio runtime
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let coordinator = Arc::clone(self);
        let period = self.config.sweep_interval;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!("Sweeper started, interval {:?}", period);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => coordinator.sweep_tick(),
                }
            }
            info!("Sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    fn sweep_tick(&self) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.sweep_once())) {
            Ok(Ok(report)) => {
                if !report.is_empty() {
                    debug!(
                        "Sweep evicted {} node(s), {} new orphan(s), leader changed: {}",
                        report.evicted.len(),
                        report.new_orphans.len(),
                        report.leader_change.is_some()
                    );
                }
            }
            Ok(Err(e)) => error!("Sweep failed: {}", e),
            Err(_) => error!("Sweep panicked; continuing with the next tick"),
        }
    }

    fn candidates(&self, now: Instant, service: Option<&str>) -> Vec<Node> {
        let mut candidates = self.registry.available(now, self.config.heartbeat_timeout);
        if let Some(service) = service {
            candidates.retain(|node| node.has_service(service));
        }
        candidates
    }

    fn record(&self, state: &mut CoordinatorState, assignment: Assignment) -> Assignment {
        state.reported_orphans.remove(&assignment.agent_id);
        if let Some(previous) = state
            .assignments
            .insert(assignment.agent_id.clone(), assignment.clone())
        {
            debug!(
                "Agent {} moved from node {} to {}",
                previous.agent_id, previous.node_id, assignment.node_id
            );
        }
        assignment
    }

    fn find_orphans(&self, state: &CoordinatorState, now: Instant) -> Vec<Assignment> {
        let healthy: HashSet<NodeId> = self
            .registry
            .healthy(now, self.config.heartbeat_timeout)
            .into_iter()
            .map(|node| node.id)
            .collect();

        let mut orphans: Vec<Assignment> = state
            .assignments
            .values()
            .filter(|a| a.is_orphaned(&healthy))
            .cloned()
            .collect();
        orphans.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        orphans
    }

    /// Apply the lowest-healthy-id rule. Returns the change, if leadership moved.
    fn run_election(
        &self,
        state: &mut CoordinatorState,
        reason: ElectionReason,
        now: Instant,
    ) -> ClusterResult<Option<LeadershipChange>> {
        let nodes = self.registry.all();
        let winner = choose_leader(&nodes, now, self.config.heartbeat_timeout);

        // Roles are rewritten even when the winner is unchanged. With a shared
        // registry this hands the flags to the coordinator electing last.
        self.registry.apply_leader(winner.as_ref())?;

        if winner == state.leader {
            return Ok(None);
        }

        let change = LeadershipChange {
            previous: state.leader.take(),
            current: winner.clone(),
            reason,
            at: Utc::now(),
        };
        state.leader = winner;

        match (&change.previous, &change.current) {
            (_, Some(current)) => info!(
                "Node {} elected leader ({}), previous: {:?}",
                current,
                reason,
                change.previous.as_ref().map(NodeId::as_str)
            ),
            (Some(previous), None) => {
                warn!("Leader {} lost ({}) and no healthy node can replace it", previous, reason)
            }
            (None, None) => {}
        }

        state.history.push_back(change.clone());
        while state.history.len() > self.config.leader_history_limit {
            state.history.pop_front();
        }
        self.publish(ClusterEvent::LeaderChanged {
            change: change.clone(),
        });

        Ok(Some(change))
    }

    fn publish(&self, event: ClusterEvent) {
        // Sending only fails when nobody is subscribed
        let _ = self.events.send(event);
    }
}

/// Handle to a running sweeper task.
///
/// Dropping the handle also stops the sweeper, without waiting for it.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Ask the sweeper to stop and wait for it to finish
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!("Sweeper task ended abnormally: {}", e);
        }
    }

    /// True once the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
