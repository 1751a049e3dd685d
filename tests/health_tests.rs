//! Heartbeat ageing, probing and reservation expiry.


use std::time::Duration;

use fleet_router::clock::Clock;
use fleet_router::config::FleetConfig;
use fleet_router::events::FleetEvent;
use fleet_router::fleet::Heartbeat;
use fleet_router::history::HistoryStatus;
use fleet_router::registry::NodeStatus;
use fleet_router::routing::{CompletionStatus, TaskCompletion, TaskRequest};
use test_harness::TestFleet;
use tokio_util::sync::CancellationToken;

async fn status_of(t: &TestFleet, node_id: &str) -> NodeStatus {
    t.fleet.get_node(node_id).await.unwrap().status
}

#[tokio::test]
async fn test_stale_then_offline_then_recovered() {
    let t = TestFleet::with_config(FleetConfig::default().with_heartbeat_ttl(120));
    t.register("n1", 4, 8.0, &[]).await;
    let supervisor = t.supervisor();

    t.advance_secs(121);
    let report = supervisor.sweep().await;
    assert_eq!(report.stale, vec!["n1".to_string()]);
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Stale);

    t.advance_secs(480);
    let report = supervisor.sweep().await;
    assert_eq!(report.offline, vec!["n1".to_string()]);
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Offline);

    let ack = t.fleet.heartbeat(Heartbeat::new("n1")).await.unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.status, NodeStatus::Active);
    assert_eq!(ack.next_heartbeat_sec, 60);
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Active);
}

#[tokio::test]
async fn test_offline_is_reported_once() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    let supervisor = t.supervisor();

    t.advance_secs(601);
    assert_eq!(supervisor.sweep().await.offline.len(), 1);
    t.advance_secs(60);
    assert!(supervisor.sweep().await.offline.is_empty());
}

#[tokio::test]
async fn test_expired_heartbeat_excluded_before_sweep() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    assert!(t.fleet.can_handle_task("lint").await.can_handle);

    // No sweep has run, status is still active.
    t.advance_secs(121);
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Active);
    assert!(!t.fleet.can_handle_task("lint").await.can_handle);

    let err = t.fleet.route_task(TaskRequest::new("lint")).await.unwrap_err();
    assert_eq!(err.code(), "NO_ELIGIBLE_NODES");
}

#[tokio::test]
async fn test_expired_nodes_are_not_probed() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    let registration_probes = t.transport.probe_count();

    t.advance_secs(121);
    let report = t.supervisor().sweep().await;
    assert_eq!(report.probed, 0);
    assert_eq!(t.transport.probe_count(), registration_probes);
}

#[tokio::test]
async fn test_duplicate_heartbeat_is_idempotent() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    t.advance_secs(5);

    let mut heartbeat = Heartbeat::new("n1");
    heartbeat.sent_at = Some(t.clock.now());
    heartbeat.current_load = Some(2);

    t.fleet.heartbeat(heartbeat.clone()).await.unwrap();
    let first = t.fleet.get_node("n1").await.unwrap();
    t.fleet.heartbeat(heartbeat).await.unwrap();
    let second = t.fleet.get_node("n1").await.unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.reliability_score, second.reliability_score);
    assert_eq!(first.tasks_completed, second.tasks_completed);
    assert_eq!(first.tasks_failed, second.tasks_failed);
    assert_eq!(first.consecutive_failures, second.consecutive_failures);
    assert_eq!(first.last_heartbeat, second.last_heartbeat);
}

#[tokio::test]
async fn test_late_heartbeat_does_not_roll_back() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    let registered = t.fleet.get_node("n1").await.unwrap().last_heartbeat;

    t.advance_secs(30);
    t.fleet.heartbeat(Heartbeat::new("n1")).await.unwrap();
    let latest = t.fleet.get_node("n1").await.unwrap().last_heartbeat;
    assert!(latest > registered);

    let mut late = Heartbeat::new("n1");
    late.sent_at = Some(registered);
    t.fleet.heartbeat(late).await.unwrap();
    assert_eq!(t.fleet.get_node("n1").await.unwrap().last_heartbeat, latest);
}

#[tokio::test]
async fn test_heartbeat_for_unknown_node() {
    let t = TestFleet::new();
    let err = t.fleet.heartbeat(Heartbeat::new("ghost")).await.unwrap_err();
    assert_eq!(err.code(), "NODE_UNKNOWN");
}

#[tokio::test]
async fn test_repeated_probe_failures_mark_unhealthy() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    let mut events = t.fleet.subscribe();
    let supervisor = t.supervisor();

    t.transport.set_down("n1", true);
    supervisor.sweep().await;
    supervisor.sweep().await;
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Active);

    let report = supervisor.sweep().await;
    assert_eq!(report.unhealthy, vec!["n1".to_string()]);
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Unhealthy);
    assert_eq!(
        events.try_recv().unwrap(),
        FleetEvent::NodeUnhealthy {
            node_id: "n1".into(),
            probe_failures: 3,
        }
    );

    // Heartbeats alone do not clear unhealthy.
    t.fleet.heartbeat(Heartbeat::new("n1")).await.unwrap();
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Unhealthy);

    t.transport.set_down("n1", false);
    let report = supervisor.sweep().await;
    assert_eq!(report.recovered, vec!["n1".to_string()]);
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_probes_do_not_stall_the_sweep() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    t.register("n2", 4, 8.0, &[]).await;
    t.transport.set_hanging("n1", true);
    t.transport.set_hanging("n2", true);
    let supervisor = t.supervisor();

    // Probes run side by side, each cut off at the 5s probe timeout.
    let started = tokio::time::Instant::now();
    let report = supervisor.sweep().await;
    let elapsed = started.elapsed();
    assert_eq!(report.probed, 2);
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(10));

    supervisor.sweep().await;
    let report = supervisor.sweep().await;
    assert_eq!(report.unhealthy.len(), 2);
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Unhealthy);
    assert_eq!(status_of(&t, "n2").await, NodeStatus::Unhealthy);
}

#[tokio::test]
async fn test_pending_node_promoted_by_probe() {
    let t = TestFleet::new();
    t.transport.set_down("n1", true);
    let result = t.register("n1", 4, 8.0, &[]).await;
    assert_eq!(result.status, NodeStatus::Pending);
    assert!(!t.fleet.can_handle_task("lint").await.can_handle);

    t.transport.set_down("n1", false);
    t.supervisor().sweep().await;
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Active);
}

#[tokio::test]
async fn test_leaked_reservation_expires_as_failure() {
    let mut config = FleetConfig::default();
    config.reservation_timeout_secs = 60;
    let t = TestFleet::with_config(config);
    t.register("n1", 4, 8.0, &[]).await;

    let routed = t.fleet.route_task(TaskRequest::new("lint")).await.unwrap();
    assert_eq!(t.fleet.get_node("n1").await.unwrap().current_tasks, 1);

    t.advance_secs(61);
    let report = t.supervisor().sweep().await;
    assert_eq!(
        report.expired_reservations,
        vec![(routed.task_id.clone(), "n1".to_string())]
    );

    let node = t.fleet.get_node("n1").await.unwrap();
    assert_eq!(node.current_tasks, 0);
    assert_eq!(node.tasks_failed, 1);
    assert_eq!(node.status, NodeStatus::Degraded);

    let history = t.fleet.task_history(10).await;
    assert_eq!(history[0].status, HistoryStatus::Expired);
    assert_eq!(t.fleet.metrics().reservations_expired, 1);

    // The worker reporting late does not count twice.
    let recorded = t
        .fleet
        .report_completion(TaskCompletion {
            task_id: routed.task_id,
            node_id: "n1".into(),
            status: CompletionStatus::Completed,
            duration_ms: 100,
        })
        .await
        .unwrap();
    assert!(!recorded);
    assert_eq!(t.fleet.get_node("n1").await.unwrap().tasks_completed, 0);
}

fn short_reservations() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.reservation_timeout_secs = 60;
    config
}

#[tokio::test]
async fn test_heartbeat_from_offline_keeps_low_score_degraded() {
    let t = TestFleet::new();
    t.register("n1", 4, 8.0, &[]).await;
    let routed = t.fleet.route_task(TaskRequest::new("lint")).await.unwrap();
    t.fleet
        .report_completion(TaskCompletion {
            task_id: routed.task_id,
            node_id: "n1".into(),
            status: CompletionStatus::Failed,
            duration_ms: 100,
        })
        .await
        .unwrap();
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Degraded);

    t.advance_secs(601);
    t.supervisor().sweep().await;
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Offline);

    let mut events = t.fleet.subscribe();
    let ack = t.fleet.heartbeat(Heartbeat::new("n1")).await.unwrap();
    assert_eq!(ack.status, NodeStatus::Degraded);
    assert_eq!(t.fleet.get_node("n1").await.unwrap().reliability_score, 0);
    assert_eq!(
        events.try_recv().unwrap(),
        FleetEvent::NodeRecovered {
            node_id: "n1".into(),
            from: NodeStatus::Offline,
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        FleetEvent::NodeDegraded {
            node_id: "n1".into(),
            reliability: 0,
        }
    );

    let err = t.fleet.route_task(TaskRequest::new("lint")).await.unwrap_err();
    assert_eq!(err.code(), "NO_ELIGIBLE_NODES");
}

#[tokio::test]
async fn test_heartbeat_from_stale_keeps_low_score_degraded() {
    let t = TestFleet::with_config(short_reservations());
    t.register("n1", 4, 8.0, &[]).await;
    t.fleet.route_task(TaskRequest::new("lint")).await.unwrap();

    // Stale and the reservation expires in the same sweep. The failure
    // lands while the node is not active, so nothing demotes it yet.
    t.advance_secs(121);
    let report = t.supervisor().sweep().await;
    assert_eq!(report.stale, vec!["n1".to_string()]);
    assert_eq!(report.expired_reservations.len(), 1);
    let node = t.fleet.get_node("n1").await.unwrap();
    assert_eq!(node.status, NodeStatus::Stale);
    assert_eq!(node.reliability_score, 0);

    let ack = t.fleet.heartbeat(Heartbeat::new("n1")).await.unwrap();
    assert_eq!(ack.status, NodeStatus::Degraded);
    assert!(!t.fleet.can_handle_task("lint").await.can_handle);
}

#[tokio::test]
async fn test_probe_recovery_keeps_low_score_degraded() {
    let t = TestFleet::with_config(short_reservations());
    t.register("n1", 4, 8.0, &[]).await;
    t.fleet.route_task(TaskRequest::new("lint")).await.unwrap();
    let supervisor = t.supervisor();

    t.transport.set_down("n1", true);
    for _ in 0..3 {
        supervisor.sweep().await;
    }
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Unhealthy);

    t.advance_secs(61);
    let report = supervisor.sweep().await;
    assert_eq!(report.expired_reservations.len(), 1);
    assert_eq!(status_of(&t, "n1").await, NodeStatus::Unhealthy);

    t.transport.set_down("n1", false);
    let report = supervisor.sweep().await;
    assert_eq!(report.recovered, vec!["n1".to_string()]);
    let node = t.fleet.get_node("n1").await.unwrap();
    assert_eq!(node.status, NodeStatus::Degraded);
    assert_eq!(node.reliability_score, 0);
    assert!(!t.fleet.can_handle_task("lint").await.can_handle);
}

#[tokio::test]
async fn test_supervisor_stops_on_cancel() {
    let t = TestFleet::new();
    let cancel = CancellationToken::new();
    let handle = t.supervisor().spawn(cancel.clone());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(t.fleet.health_monitoring());
    assert!(t.fleet.cluster_state().await.health_monitoring);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("supervisor should stop")
        .unwrap();
    assert!(!t.fleet.health_monitoring());
}
