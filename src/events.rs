use serde::Serialize;

use crate::registry::{NodeStatus, Tier};
use crate::routing::CompletionStatus;

/// Lifecycle notifications published on the fleet's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    NodeRegistered {
        node_id: String,
        tier: Tier,
        status: NodeStatus,
    },
    NodeRemoved {
        node_id: String,
    },
    NodeStale {
        node_id: String,
        heartbeat_age_secs: f64,
    },
    NodeOffline {
        node_id: String,
    },
    NodeRecovered {
        node_id: String,
        from: NodeStatus,
    },
    NodeUnhealthy {
        node_id: String,
        probe_failures: u32,
    },
    NodeDegraded {
        node_id: String,
        reliability: u8,
    },
    NodeRestored {
        node_id: String,
        reliability: u8,
    },
    TaskRouted {
        task_id: String,
        node_id: String,
        task_type: String,
    },
    TaskFailover {
        task_id: String,
        from: String,
        to: String,
    },
    TaskCompleted {
        task_id: String,
        node_id: String,
        status: CompletionStatus,
        duration_ms: u64,
    },
    ReservationExpired {
        task_id: String,
        node_id: String,
    },
}
