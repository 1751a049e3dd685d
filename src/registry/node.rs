use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::registry::slots::SlotLedger;
use crate::registry::tier::Tier;

/// Lifecycle status of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Active,
    Stale,
    Unhealthy,
    Degraded,
    Offline,
}

impl NodeStatus {
    pub const ALL: [NodeStatus; 6] = [
        NodeStatus::Pending,
        NodeStatus::Active,
        NodeStatus::Stale,
        NodeStatus::Unhealthy,
        NodeStatus::Degraded,
        NodeStatus::Offline,
    ];

    /// Only active nodes accept new tasks.
    pub fn is_routable(self) -> bool {
        self == NodeStatus::Active
    }

    /// Edges of the node state machine.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Offline)
                | (Active, Stale)
                | (Active, Unhealthy)
                | (Active, Degraded)
                | (Active, Offline)
                | (Stale, Active)
                | (Stale, Unhealthy)
                | (Stale, Offline)
                | (Unhealthy, Active)
                | (Unhealthy, Offline)
                | (Degraded, Active)
                | (Degraded, Offline)
                | (Offline, Active)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Stale => write!(f, "stale"),
            NodeStatus::Unhealthy => write!(f, "unhealthy"),
            NodeStatus::Degraded => write!(f, "degraded"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        NodeStatus::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| FleetError::Config(format!("unknown node status: {s}")))
    }
}

fn default_cores() -> u32 {
    1
}

fn default_ram_gb() -> f64 {
    1.0
}

fn default_unknown() -> String {
    "unknown".to_string()
}

fn default_arch() -> String {
    "x86_64".to_string()
}

/// Declared hardware of a worker. Missing fields take conservative defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    #[serde(default = "default_unknown")]
    pub cpu_model: String,
    #[serde(default = "default_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_cores")]
    pub cpu_threads: u32,
    #[serde(default = "default_ram_gb")]
    pub ram_gb: f64,
    #[serde(default)]
    pub gpu_model: Option<String>,
    #[serde(default)]
    pub gpu_vram_gb: f64,
    #[serde(default)]
    pub storage_gb: f64,
    #[serde(default = "default_unknown")]
    pub os: String,
    #[serde(default = "default_arch")]
    pub arch: String,
}

impl Default for HardwareProfile {
    fn default() -> Self {
        Self {
            cpu_model: default_unknown(),
            cpu_cores: default_cores(),
            cpu_threads: default_cores(),
            ram_gb: default_ram_gb(),
            gpu_model: None,
            gpu_vram_gb: 0.0,
            storage_gb: 0.0,
            os: default_unknown(),
            arch: default_arch(),
        }
    }
}

impl HardwareProfile {
    pub fn new(cpu_cores: u32, ram_gb: f64) -> Self {
        Self {
            cpu_cores,
            cpu_threads: cpu_cores,
            ram_gb,
            ..Default::default()
        }
    }

    pub fn with_gpu(mut self, model: impl Into<String>, vram_gb: f64) -> Self {
        self.gpu_model = Some(model.into());
        self.gpu_vram_gb = vram_gb;
        self
    }

    pub fn has_gpu(&self) -> bool {
        self.gpu_model.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// Point-in-time resource usage reported by a worker heartbeat.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_usage_pct: Option<f64>,
    pub ram_usage_pct: Option<f64>,
    pub disk_usage_pct: Option<f64>,
    pub load_avg: Option<Vec<f64>>,
    pub uptime_sec: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Metrics a worker reports about itself. Informational only: the router's
/// own counters come from completion reports.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: Option<u64>,
    pub tasks_failed: Option<u64>,
    pub avg_task_duration_ms: Option<f64>,
    pub active_tasks: Option<u32>,
}

/// Everything the router knows about one registered worker.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub name: String,
    pub address: String,
    pub location: String,
    pub hardware: HardwareProfile,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub tier: Tier,
    pub max_concurrent: usize,
    pub slots: SlotLedger,
    pub reliability_score: u8,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub consecutive_failures: u32,
    pub consecutive_probe_failures: u32,
    pub failure_count: u64,
    pub total_task_duration_ms: u64,
    pub avg_task_duration_ms: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub system_stats: Option<SystemStats>,
    pub agent_metrics: Option<AgentMetrics>,
    pub current_load: Option<u32>,
    /// Registration order, used as the stable tie-breaker when ranking.
    pub seq: u64,
    status: NodeStatus,
}

impl NodeRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        name: String,
        address: String,
        location: String,
        hardware: HardwareProfile,
        capabilities: Vec<String>,
        tags: Vec<String>,
        capacity_ceiling: usize,
        status: NodeStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let tier = Tier::classify(&hardware);
        let max_concurrent = Tier::max_concurrent(&hardware, capacity_ceiling);
        Self {
            node_id,
            name,
            address,
            location,
            hardware,
            capabilities,
            tags,
            tier,
            max_concurrent,
            slots: SlotLedger::new(max_concurrent),
            reliability_score: 100,
            tasks_completed: 0,
            tasks_failed: 0,
            consecutive_failures: 0,
            consecutive_probe_failures: 0,
            failure_count: 0,
            total_task_duration_ms: 0,
            avg_task_duration_ms: 0.0,
            last_heartbeat: now,
            registered_at: now,
            system_stats: None,
            agent_metrics: None,
            current_load: None,
            seq: 0,
            status,
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Move to `next` along a state machine edge. Returns the previous status.
    /// Re-entering the current status is a no-op.
    pub fn transition(&mut self, next: NodeStatus) -> Result<NodeStatus> {
        let prev = self.status;
        if prev == next {
            return Ok(prev);
        }
        if !prev.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                node_id: self.node_id.clone(),
                from: prev,
                to: next,
            });
        }
        self.status = next;
        tracing::debug!(node_id = %self.node_id, from = %prev, to = %next, "Node status changed");
        Ok(prev)
    }

    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_heartbeat).num_milliseconds() as f64 / 1000.0
    }

    /// Heartbeat at least `ttl` old, regardless of what the last sweep decided.
    pub fn heartbeat_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_heartbeat >= ttl
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.len() < self.max_concurrent
    }

    pub fn utilization(&self) -> f64 {
        self.slots.len() as f64 / self.max_concurrent.max(1) as f64
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag))
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            node_id: self.node_id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            tier: self.tier,
            status: self.status,
            hardware: self.hardware.clone(),
            capabilities: self.capabilities.clone(),
            tags: self.tags.clone(),
            location: self.location.clone(),
            reliability_score: self.reliability_score,
            max_concurrent: self.max_concurrent,
            current_tasks: self.slots.len(),
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            consecutive_failures: self.consecutive_failures,
            failure_count: self.failure_count,
            current_load: self.current_load,
            avg_task_duration_ms: self.avg_task_duration_ms.round() as u64,
            system_stats: self.system_stats.clone(),
            agent_metrics: self.agent_metrics.clone(),
            registered_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Serializable view of a node for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub name: String,
    pub address: String,
    pub tier: Tier,
    pub status: NodeStatus,
    pub hardware: HardwareProfile,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub location: String,
    pub reliability_score: u8,
    pub max_concurrent: usize,
    pub current_tasks: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub consecutive_failures: u32,
    pub failure_count: u64,
    /// Load the worker last reported about itself.
    pub current_load: Option<u32>,
    pub avg_task_duration_ms: u64,
    pub system_stats: Option<SystemStats>,
    pub agent_metrics: Option<AgentMetrics>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: NodeStatus) -> NodeRecord {
        NodeRecord::new(
            "n1".into(),
            "n1".into(),
            "http://n1".into(),
            "local".into(),
            HardwareProfile::new(8, 16.0),
            vec!["Docker".into()],
            vec![],
            16,
            status,
            Utc::now(),
        )
    }

    #[test]
    fn offline_only_leaves_to_active() {
        let mut node = record(NodeStatus::Pending);
        node.transition(NodeStatus::Offline).unwrap();
        assert!(node.transition(NodeStatus::Stale).is_err());
        assert!(node.transition(NodeStatus::Degraded).is_err());
        assert_eq!(node.transition(NodeStatus::Active).unwrap(), NodeStatus::Offline);
    }

    #[test]
    fn degraded_requires_active() {
        let mut node = record(NodeStatus::Stale);
        let err = node.transition(NodeStatus::Degraded).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(node.status(), NodeStatus::Stale);
    }

    #[test]
    fn same_status_is_noop() {
        let mut node = record(NodeStatus::Active);
        assert_eq!(node.transition(NodeStatus::Active).unwrap(), NodeStatus::Active);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Stale".parse::<NodeStatus>().unwrap(), NodeStatus::Stale);
        assert!("zombie".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn capability_lookup_ignores_case() {
        let node = record(NodeStatus::Active);
        assert!(node.has_capability("docker"));
        assert!(!node.has_capability("gpu"));
    }

    #[test]
    fn hardware_defaults_from_empty_json() {
        let hw: HardwareProfile = serde_json::from_str("{}").unwrap();
        assert_eq!(hw.cpu_cores, 1);
        assert_eq!(hw.ram_gb, 1.0);
        assert_eq!(hw.arch, "x86_64");
        assert!(!hw.has_gpu());
    }
}
