use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use agent_cluster::testing::registration;
use agent_cluster::{ClusterError, LoadBalancer, Node, NodeId, NodeRegistry, Strategy};

const TIMEOUT: Duration = Duration::from_secs(30);

// Registry holding one node per (id, capacity, load) entry, all heartbeating at `now`
fn registry(now: Instant, nodes: &[(&str, i64, u32)]) -> NodeRegistry {
    let registry = NodeRegistry::new();
    for (id, capacity, load) in nodes {
        registry.register(registration(id, *capacity).validate().unwrap(), now);
        registry.heartbeat(&NodeId::from(*id), *load, now).unwrap();
    }
    registry
}

fn ids(nodes: &[&Node]) -> Vec<String> {
    nodes.iter().map(|n| n.id.to_string()).collect()
}

#[test]
fn test_round_robin_visits_each_node_once_in_id_order() {
    let now = Instant::now();
    let registry = registry(now, &[("n3", 4, 0), ("n1", 4, 0), ("n4", 4, 0), ("n2", 4, 0)]);
    let candidates = registry.available(now, TIMEOUT);
    let balancer = LoadBalancer::new();

    let picked: Vec<&Node> = (0..candidates.len())
        .map(|_| balancer.select(&candidates, Strategy::RoundRobin, None).unwrap())
        .collect();

    assert_eq!(ids(&picked), vec!["n1", "n2", "n3", "n4"]);
}

#[test]
fn test_least_loaded_returns_minimal_load_factor() {
    let now = Instant::now();
    let registry = registry(
        now,
        &[("a", 10, 5), ("b", 4, 1), ("c", 8, 6), ("d", 2, 1), ("e", 100, 30)],
    );
    let candidates = registry.available(now, TIMEOUT);
    let balancer = LoadBalancer::new();

    let chosen = balancer.select(&candidates, Strategy::LeastLoaded, None).unwrap();
    let minimum = candidates
        .iter()
        .map(Node::load_factor)
        .fold(f64::INFINITY, f64::min);

    assert_eq!(chosen.load_factor(), minimum);
    assert_eq!(chosen.id, NodeId::from("b"));
}

#[test]
fn test_no_strategy_picks_a_full_node_from_available() {
    let now = Instant::now();
    let registry = registry(now, &[("full", 2, 2), ("over", 1, 5), ("free", 3, 1), ("idle", 3, 0)]);
    let candidates = registry.available(now, TIMEOUT);
    let balancer = LoadBalancer::with_seed(42);

    for strategy in Strategy::ALL {
        for _ in 0..20 {
            let node = balancer.select(&candidates, strategy, None).unwrap();
            assert!(node.load < node.capacity, "{} picked {}", strategy, node.id);
        }
    }
}

#[test]
fn test_every_strategy_fails_on_empty_candidates() {
    let balancer = LoadBalancer::new();
    for strategy in Strategy::ALL {
        assert_eq!(
            balancer.select(&[], strategy, Some("svc")).unwrap_err(),
            ClusterError::NoAvailableNodes
        );
    }
}

#[test]
fn test_weighted_favours_headroom() {
    let now = Instant::now();
    let registry = registry(now, &[("big", 100, 10), ("small", 10, 9)]);
    let candidates = registry.available(now, TIMEOUT);
    let balancer = LoadBalancer::with_seed(1);

    let mut counts: HashMap<NodeId, usize> = HashMap::new();
    for _ in 0..1000 {
        let node = balancer.select(&candidates, Strategy::Weighted, None).unwrap();
        *counts.entry(node.id.clone()).or_default() += 1;
    }

    // Headroom is 90 against 1
    assert!(counts[&NodeId::from("big")] > 900);
}

#[test]
fn test_concurrent_round_robin_is_fair() {
    let now = Instant::now();
    let registry = registry(now, &[("n1", 8, 0), ("n2", 8, 0), ("n3", 8, 0)]);
    let candidates = Arc::new(registry.available(now, TIMEOUT));
    let balancer = Arc::new(LoadBalancer::new());

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let candidates = Arc::clone(&candidates);
            let balancer = Arc::clone(&balancer);
            thread::spawn(move || {
                (0..300)
                    .map(|_| {
                        balancer
                            .select(&candidates, Strategy::RoundRobin, None)
                            .unwrap()
                            .id
                            .clone()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut counts: HashMap<NodeId, usize> = HashMap::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            *counts.entry(id).or_default() += 1;
        }
    }

    // 1800 calls over 3 nodes; an atomic cursor never skips or repeats
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&count| count == 600));
}
