use std::sync::Arc;

use agent_cluster::{
    ClusterCoordinator, CoordinatorConfig, ErrorKind, NodeRegistration, NodeRegistry, Reply,
    Request, Response, Strategy,
};
use serde_json::{json, Value};

fn coordinator() -> ClusterCoordinator {
    ClusterCoordinator::new(CoordinatorConfig::default(), Arc::new(NodeRegistry::new())).unwrap()
}

// Feed a scripted session through the JSON entry point, one line per request
fn session(coord: &ClusterCoordinator, script: &[Value]) -> Vec<Value> {
    script
        .iter()
        .map(|request| {
            let line = coord.handle_json(&request.to_string()).unwrap();
            serde_json::from_str(&line).unwrap()
        })
        .collect()
}

#[test]
fn test_json_session() {
    let coord = coordinator();
    let replies = session(
        &coord,
        &[
            json!({"op": "register", "id": "edge-1", "address": "10.0.0.1:9000", "capacity": 3}),
            json!({"op": "register", "id": "edge-2", "address": "10.0.0.2:9000", "capacity": 3, "services": ["ocr"]}),
            json!({"op": "heartbeat", "id": "edge-1", "load": 2}),
            json!({"op": "assign", "agent_id": "scan", "required_service": "ocr"}),
            json!({"op": "assign_to", "agent_id": "pinned", "node_id": "edge-1"}),
            json!({"op": "assignments"}),
            json!({"op": "reassign", "agent_id": "pinned", "strategy": "least_loaded"}),
            json!({"op": "release", "agent_id": "scan"}),
            json!({"op": "elect"}),
            json!({"op": "health"}),
        ],
    );

    assert!(replies.iter().all(|r| r["status"] == "ok"), "{:#?}", replies);

    assert_eq!(replies[0]["node"]["role"], "leader");
    assert_eq!(replies[1]["node"]["role"], "follower");
    assert_eq!(replies[2]["node"]["load"], 2);
    assert_eq!(replies[3]["assignment"]["node_id"], "edge-2");
    assert_eq!(replies[4]["assignment"]["forced"], true);
    assert_eq!(replies[5]["assignments"].as_array().unwrap().len(), 2);
    assert_eq!(replies[6]["assignment"]["node_id"], "edge-2");
    assert_eq!(replies[7]["assignment"]["agent_id"], "scan");
    assert_eq!(replies[8]["leader"], "edge-1");
    assert_eq!(replies[9]["health"], "healthy");
}

#[test]
fn test_every_error_carries_kind_and_message() {
    let coord = coordinator();
    let replies = session(
        &coord,
        &[
            json!({"op": "register", "id": "", "address": "x", "capacity": 1}),
            json!({"op": "register", "id": "n1", "address": "x", "capacity": -1}),
            json!({"op": "heartbeat", "id": "n9", "load": 0}),
            json!({"op": "assign", "agent_id": ""}),
            json!({"op": "reassign", "agent_id": "nobody"}),
            json!({"op": "heartbeat", "id": "n1", "load": -4}),
        ],
    );

    let kinds: Vec<&str> = replies.iter().map(|r| r["kind"].as_str().unwrap()).collect();
    assert_eq!(
        kinds,
        vec![
            "invalid_node_id",
            "invalid_capacity",
            "node_not_found",
            "invalid_agent_id",
            "assignment_not_found",
            "bad_request",
        ]
    );
    assert!(replies
        .iter()
        .all(|r| r["status"] == "error" && !r["message"].as_str().unwrap().is_empty()));
}

#[test]
fn test_typed_requests() {
    let coord = coordinator();

    let response = coord.handle(Request::Register(NodeRegistration::new("n1", "host:1", 2)));
    assert!(matches!(response, Response::Ok(Reply::Node { .. })));

    let response = coord.handle(Request::Assign {
        agent_id: "agent".to_string(),
        required_service: None,
        strategy: Some(Strategy::CapacityAware),
    });
    match response {
        Response::Ok(Reply::Assignment { assignment }) => {
            assert_eq!(assignment.strategy, Some(Strategy::CapacityAware));
        }
        other => panic!("Expected assignment, got {:?}", other),
    }

    // Removing an id that was never registered is a no-op, well-formed or not
    let response = coord.handle(Request::Remove { id: "bad id".to_string() });
    assert_eq!(response, Response::Ok(Reply::Removed { node: None }));

    let response = coord.handle(Request::Heartbeat {
        id: "bad id".to_string(),
        load: 0,
    });
    assert_eq!(
        response,
        Response::Error {
            kind: ErrorKind::NodeNotFound,
            message: "Node not found: bad id".to_string(),
        }
    );
}
