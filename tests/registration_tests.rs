//! Registration, re-registration and removal.


use fleet_router::config::FleetConfig;
use fleet_router::events::FleetEvent;
use fleet_router::fleet::{NodeFilter, RegisterNode};
use fleet_router::history::HistoryStatus;
use fleet_router::registry::{HardwareProfile, NodeStatus, Tier};
use fleet_router::routing::{CompletionStatus, TaskCompletion, TaskRequest};
use test_harness::{addr, TestFleet};

async fn complete(t: &TestFleet, node_id: &str, status: CompletionStatus) {
    let routed = t
        .fleet
        .route_task(TaskRequest::new("lint").with_preferred_node(node_id))
        .await
        .unwrap();
    t.fleet
        .report_completion(TaskCompletion {
            task_id: routed.task_id,
            node_id: node_id.to_string(),
            status,
            duration_ms: 2_000,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_register_classifies_and_sizes() {
    let t = TestFleet::new();
    let mut events = t.fleet.subscribe();

    let result = t.register("beast", 32, 128.0, &["docker"]).await;
    assert!(result.success);
    assert_eq!(result.tier, Tier::Powerhouse);
    assert_eq!(result.status, NodeStatus::Active);
    assert_eq!(result.max_concurrent, 16);

    let result = t.register("laptop", 4, 6.0, &[]).await;
    assert_eq!(result.tier, Tier::Light);
    assert_eq!(result.max_concurrent, 2);

    assert_eq!(
        events.try_recv().unwrap(),
        FleetEvent::NodeRegistered {
            node_id: "beast".into(),
            tier: Tier::Powerhouse,
            status: NodeStatus::Active,
        }
    );
    assert_eq!(t.fleet.metrics().registrations, 2);
}

#[tokio::test]
async fn test_unreachable_node_admitted_as_pending() {
    let t = TestFleet::new();
    t.transport.set_down("n1", true);

    let result = t.register("n1", 4, 8.0, &[]).await;
    assert!(result.success);
    assert_eq!(result.status, NodeStatus::Pending);

    let err = t.fleet.route_task(TaskRequest::new("lint")).await.unwrap_err();
    assert_eq!(err.code(), "NO_ELIGIBLE_NODES");

    // A heartbeat is proof of life.
    let ack = t
        .fleet
        .heartbeat(fleet_router::fleet::Heartbeat::new("n1"))
        .await
        .unwrap();
    assert_eq!(ack.status, NodeStatus::Active);
}

#[tokio::test]
async fn test_missing_identity_rejected() {
    let t = TestFleet::new();
    let err = t
        .fleet
        .register(RegisterNode::new("", addr("n1")))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_REGISTRATION");

    let err = t
        .fleet
        .register(RegisterNode::new("n1", ""))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_REGISTRATION");
    assert!(t.fleet.list_nodes(&NodeFilter::default()).await.is_empty());
}

#[tokio::test]
async fn test_missing_hardware_uses_minimal_defaults() {
    let t = TestFleet::new();
    let result = t
        .fleet
        .register(RegisterNode::new("bare", addr("bare")))
        .await
        .unwrap();
    assert_eq!(result.tier, Tier::Light);
    assert_eq!(result.max_concurrent, 1);

    let node = t.fleet.get_node("bare").await.unwrap();
    assert_eq!(node.hardware.cpu_cores, 1);
    assert_eq!(node.location, "local");
    assert_eq!(node.name, "bare");
}

#[tokio::test]
async fn test_reregistration_preserves_reliability() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    complete(&t, "n1", CompletionStatus::Completed).await;
    complete(&t, "n1", CompletionStatus::Completed).await;
    complete(&t, "n1", CompletionStatus::Failed).await;
    let before = t.fleet.get_node("n1").await.unwrap();
    assert_eq!(before.reliability_score, 57);

    t.advance_secs(60);
    let result = t.register("n1", 16, 64.0, &["docker", "python"]).await;
    assert_eq!(result.tier, Tier::Powerhouse);

    let after = t.fleet.get_node("n1").await.unwrap();
    assert_eq!(after.hardware.cpu_cores, 16);
    assert_eq!(after.capabilities, vec!["docker", "python"]);
    assert_eq!(after.tasks_completed, 2);
    assert_eq!(after.tasks_failed, 1);
    assert_eq!(after.consecutive_failures, 1);
    assert_eq!(after.reliability_score, 57);
    assert_eq!(after.registered_at, before.registered_at);
    assert_eq!(t.fleet.list_nodes(&NodeFilter::default()).await.len(), 1);
}

#[tokio::test]
async fn test_reregistration_fresh_start_when_configured() {
    let mut config = FleetConfig::default();
    config.preserve_reliability_on_reregister = false;
    let t = TestFleet::with_config(config);
    t.register("n1", 4, 8.0, &[]).await;
    complete(&t, "n1", CompletionStatus::Failed).await;
    assert_eq!(t.fleet.get_node("n1").await.unwrap().tasks_failed, 1);

    t.register("n1", 4, 8.0, &[]).await;
    let node = t.fleet.get_node("n1").await.unwrap();
    assert_eq!(node.tasks_failed, 0);
    assert_eq!(node.reliability_score, 100);
    assert_eq!(node.status, NodeStatus::Active);
}

#[tokio::test]
async fn test_reregistration_abandons_in_flight_tasks() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    let routed = t.fleet.route_task(TaskRequest::new("lint")).await.unwrap();

    t.register("n1", 4, 8.0, &[]).await;
    let node = t.fleet.get_node("n1").await.unwrap();
    assert_eq!(node.current_tasks, 0);
    assert_eq!(node.tasks_failed, 0);

    let history = t.fleet.task_history(10).await;
    assert_eq!(history[0].task_id, routed.task_id);
    assert_eq!(history[0].status, HistoryStatus::Abandoned);
}

#[tokio::test]
async fn test_remove_node() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    t.register("n2", 4, 8.0, &[]).await;

    let removed = t.fleet.remove_node("n1").await.unwrap();
    assert_eq!(removed.node_id, "n1");
    assert!(t.fleet.get_node("n1").await.is_none());
    assert_eq!(t.fleet.metrics().removals, 1);

    let err = t.fleet.remove_node("n1").await.unwrap_err();
    assert_eq!(err.code(), "NODE_UNKNOWN");

    // Removal does not disturb the order of the remaining nodes.
    t.register("n3", 4, 8.0, &[]).await;
    let ids: Vec<String> = t
        .fleet
        .list_nodes(&NodeFilter::default())
        .await
        .into_iter()
        .map(|n| n.node_id)
        .collect();
    assert_eq!(ids, vec!["n2", "n3"]);
}

#[tokio::test]
async fn test_cluster_state_aggregates() {
    let t = TestFleet::new();
    t.register("big", 16, 64.0, &[]).await;
    t.register_with(
        "gpu",
        HardwareProfile::new(8, 32.0).with_gpu("A100", 40.0),
        &["python"],
    )
    .await;
    t.transport.set_down("pending", true);
    t.register("pending", 2, 4.0, &[]).await;

    t.fleet.route_task(TaskRequest::new("lint")).await.unwrap();

    let state = t.fleet.cluster_state().await;
    assert_eq!(state.total_nodes, 3);
    assert_eq!(state.by_status["active"], 2);
    assert_eq!(state.by_status["pending"], 1);
    assert_eq!(state.by_tier["powerhouse"], 1);
    assert_eq!(state.by_tier["standard"], 1);
    assert_eq!(state.by_tier["light"], 1);
    // Capacity counts active nodes only.
    assert_eq!(state.capacity.total_cores, 24);
    assert_eq!(state.capacity.gpu_nodes, 1);
    assert_eq!(state.capacity.total_gpu_vram_gb, 40.0);
    assert_eq!(state.capacity.total_slots, 8 + 4);
    assert_eq!(state.capacity.used_slots, 1);
    assert_eq!(state.capacity.available_slots, 11);
    assert_eq!(state.capacity.utilization_pct, 8.3);
    assert_eq!(state.avg_reliability, 100.0);
    assert_eq!(state.metrics.tasks_routed, 1);
}
