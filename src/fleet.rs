//! The fleet manager: the single owner of node records.
//!
//! Every mutation of a [`NodeRecord`] happens under the store's write lock.
//! Network calls (registration probe, dispatch, sweep probes) are made with
//! the lock released and their outcome is applied in a second short
//! critical section.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::config::FleetConfig;
use crate::error::{FleetError, Result};
use crate::events::FleetEvent;
use crate::history::{HistoryStatus, TaskHistory, TaskHistoryEntry};
use crate::registry::{
    AgentMetrics, HardwareProfile, InMemoryNodeStore, NodeRecord, NodeStatus, NodeStore,
    NodeSummary, SystemStats, Tier,
};
use crate::reliability::{self, ReliabilityChange};
use crate::routing::matcher::{find_eligible, MatchCriteria};
use crate::routing::ranker::{rank, RankedCandidate};
use crate::routing::{ProfileTable, RequirementProfile, TaskCompletion};
use crate::transport::NodeTransport;

const EVENT_CHANNEL_CAPACITY: usize = 256;

fn default_location() -> String {
    "local".to_string()
}

/// Registration request sent by a worker agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterNode {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "tunnel_url")]
    pub address: String,
    #[serde(default)]
    pub hardware: Option<HardwareProfile>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_location")]
    pub location: String,
}

impl RegisterNode {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            location: default_location(),
            ..Default::default()
        }
    }

    pub fn with_hardware(mut self, hardware: HardwareProfile) -> Self {
        self.hardware = Some(hardware);
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub success: bool,
    pub node_id: String,
    pub tier: Tier,
    pub status: NodeStatus,
    pub max_concurrent: usize,
}

/// Periodic liveness message from a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub node_id: String,
    /// Status the worker believes it has. Informational only.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub metrics: Option<AgentMetrics>,
    #[serde(default)]
    pub current_load: Option<u32>,
    #[serde(default)]
    pub system_stats: Option<SystemStats>,
    /// When the worker sent it. Defaults to the time of receipt.
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

impl Heartbeat {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub accepted: bool,
    pub node_id: String,
    pub status: NodeStatus,
    pub next_heartbeat_sec: u64,
}

/// Query filter for [`FleetManager::list_nodes`]. Unset fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub tier: Option<Tier>,
    pub capability: Option<String>,
    pub location: Option<String>,
}

impl NodeFilter {
    pub fn matches(&self, node: &NodeRecord) -> bool {
        self.status.map_or(true, |s| node.status() == s)
            && self.tier.map_or(true, |t| node.tier == t)
            && self
                .capability
                .as_deref()
                .map_or(true, |c| node.has_capability(c))
            && self
                .location
                .as_deref()
                .map_or(true, |l| node.location.eq_ignore_ascii_case(l))
    }
}

/// Dry-run answer to "could this task type be placed right now".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCheck {
    pub task_type: String,
    pub can_handle: bool,
    pub eligible_nodes: usize,
    pub requirements: RequirementProfile,
    pub best_node: Option<RankedCandidate>,
}

#[derive(Debug, Default)]
pub struct FleetMetrics {
    tasks_routed: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    failovers: AtomicU64,
    registrations: AtomicU64,
    removals: AtomicU64,
    reservations_expired: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tasks_routed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub failovers: u64,
    pub registrations: u64,
    pub removals: u64,
    pub reservations_expired: u64,
}

impl FleetMetrics {
    pub(crate) fn task_routed(&self) {
        self.tasks_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self, success: bool) {
        if success {
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reservation_expired(&self) {
        self.reservations_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_routed: self.tasks_routed.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            reservations_expired: self.reservations_expired.load(Ordering::Relaxed),
        }
    }
}

/// Capacity of the active part of the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputeCapacity {
    pub total_cores: u64,
    pub total_ram_gb: f64,
    pub total_gpu_vram_gb: f64,
    pub gpu_nodes: usize,
    pub total_slots: usize,
    pub used_slots: usize,
    pub available_slots: usize,
    pub utilization_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub total_nodes: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_tier: BTreeMap<String, usize>,
    pub capacity: ComputeCapacity,
    pub avg_reliability: f64,
    pub metrics: MetricsSnapshot,
    pub health_monitoring: bool,
    pub heartbeat_ttl_secs: u64,
    pub task_routing: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

pub struct FleetManager {
    pub(crate) config: Arc<FleetConfig>,
    pub(crate) profiles: ProfileTable,
    pub(crate) store: RwLock<Box<dyn NodeStore>>,
    pub(crate) history: RwLock<TaskHistory>,
    pub(crate) metrics: FleetMetrics,
    pub(crate) transport: Arc<dyn NodeTransport>,
    pub(crate) clock: Arc<dyn Clock>,
    events: broadcast::Sender<FleetEvent>,
    next_seq: AtomicU64,
    health_monitoring: AtomicBool,
}

impl FleetManager {
    pub fn new(config: FleetConfig, transport: Arc<dyn NodeTransport>) -> Self {
        Self::with_parts(
            config,
            Box::new(InMemoryNodeStore::new()),
            transport,
            Arc::new(SystemClock),
        )
    }

    pub fn with_parts(
        config: FleetConfig,
        store: Box<dyn NodeStore>,
        transport: Arc<dyn NodeTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let next_seq = store.list().iter().map(|n| n.seq + 1).max().unwrap_or(0);
        Self {
            profiles: ProfileTable::with_overrides(&config.task_profiles),
            history: RwLock::new(TaskHistory::with_capacity(config.max_task_history)),
            config: Arc::new(config),
            store: RwLock::new(store),
            metrics: FleetMetrics::default(),
            transport,
            clock,
            events,
            next_seq: AtomicU64::new(next_seq),
            health_monitoring: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: FleetEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_reliability_change(&self, node: &NodeRecord, change: ReliabilityChange) {
        match change {
            ReliabilityChange::Degraded => self.emit(FleetEvent::NodeDegraded {
                node_id: node.node_id.clone(),
                reliability: node.reliability_score,
            }),
            ReliabilityChange::Restored => self.emit(FleetEvent::NodeRestored {
                node_id: node.node_id.clone(),
                reliability: node.reliability_score,
            }),
            ReliabilityChange::Unchanged => {}
        }
    }

    pub(crate) fn set_health_monitoring(&self, running: bool) {
        self.health_monitoring.store(running, Ordering::Relaxed);
    }

    pub fn health_monitoring(&self) -> bool {
        self.health_monitoring.load(Ordering::Relaxed)
    }

    pub(crate) fn match_criteria<'a>(
        &'a self,
        profile: &'a RequirementProfile,
        preferred_node: Option<&'a str>,
        now: DateTime<Utc>,
    ) -> MatchCriteria<'a> {
        MatchCriteria {
            profile,
            hard_tags: &self.config.hard_filter_tags,
            preferred_node,
            now,
            heartbeat_ttl: self.config.heartbeat_ttl(),
        }
    }

    /// Admit a worker, or replace the record of one that registered before.
    ///
    /// The node is probed once. A failed probe still admits it, as `pending`.
    pub async fn register(&self, request: RegisterNode) -> Result<RegistrationResult> {
        let node_id = request.node_id.trim().to_string();
        let address = request.address.trim().trim_end_matches('/').to_string();
        if node_id.is_empty() {
            return Err(FleetError::InvalidRegistration(
                "node_id is required".to_string(),
            ));
        }
        if address.is_empty() {
            return Err(FleetError::InvalidRegistration(
                "address is required".to_string(),
            ));
        }
        if let Err(e) = reqwest::Url::parse(&address) {
            return Err(FleetError::InvalidRegistration(format!(
                "address {address:?} is not a URL: {e}"
            )));
        }

        let probe_timeout = self.config.registration_probe_timeout();
        let reachable = match tokio::time::timeout(
            probe_timeout,
            self.transport.probe_health(&address, probe_timeout),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(node_id = %node_id, address = %address, error = %e, "Registration probe failed, admitting as pending");
                false
            }
            Err(_) => {
                tracing::warn!(node_id = %node_id, address = %address, "Registration probe timed out, admitting as pending");
                false
            }
        };
        let initial = if reachable {
            NodeStatus::Active
        } else {
            NodeStatus::Pending
        };

        let now = self.clock.now();
        let name = request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| node_id.clone());
        let mut record = NodeRecord::new(
            node_id.clone(),
            name,
            address,
            request.location,
            request.hardware.unwrap_or_default(),
            request.capabilities,
            request.tags,
            self.config.capacity_ceiling,
            initial,
            now,
        );

        let abandoned = {
            let mut store = self.store.write().await;
            let abandoned = match store.get(&node_id) {
                Some(mut previous) => {
                    record.seq = previous.seq;
                    if self.config.preserve_reliability_on_reregister {
                        record.registered_at = previous.registered_at;
                        record.tasks_completed = previous.tasks_completed;
                        record.tasks_failed = previous.tasks_failed;
                        record.consecutive_failures = previous.consecutive_failures;
                        record.failure_count = previous.failure_count;
                        record.total_task_duration_ms = previous.total_task_duration_ms;
                        record.avg_task_duration_ms = previous.avg_task_duration_ms;
                        reliability::refresh(&mut record, self.config.degrade_floor, false);
                    }
                    tracing::info!(node_id = %node_id, previous_status = %previous.status(), "Node re-registered");
                    previous.slots.clear()
                }
                None => {
                    record.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    Vec::new()
                }
            };
            store.upsert(record.clone());
            abandoned
        };

        if !abandoned.is_empty() {
            let mut history = self.history.write().await;
            for task_id in &abandoned {
                history.finish(task_id, HistoryStatus::Abandoned, None, now);
            }
            tracing::warn!(node_id = %node_id, count = abandoned.len(), "Released in-flight reservations of re-registered node");
        }

        self.metrics.registrations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            node_id = %record.node_id,
            tier = %record.tier,
            status = %record.status(),
            cores = record.hardware.cpu_cores,
            ram_gb = record.hardware.ram_gb,
            max_concurrent = record.max_concurrent,
            "Node registered"
        );
        self.emit(FleetEvent::NodeRegistered {
            node_id: record.node_id.clone(),
            tier: record.tier,
            status: record.status(),
        });

        let status = record.status();
        Ok(RegistrationResult {
            success: true,
            node_id: record.node_id,
            tier: record.tier,
            status,
            max_concurrent: record.max_concurrent,
        })
    }

    /// Record a heartbeat. The latest timestamp wins; a late heartbeat never
    /// moves `last_heartbeat` backwards.
    pub async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<HeartbeatAck> {
        let now = self.clock.now();
        let sent_at = heartbeat.sent_at.map(|t| t.min(now)).unwrap_or(now);

        let mut store = self.store.write().await;
        let Some(mut node) = store.get(&heartbeat.node_id) else {
            tracing::warn!(node_id = %heartbeat.node_id, "Heartbeat from unknown node");
            return Err(FleetError::NodeUnknown(heartbeat.node_id));
        };

        if sent_at >= node.last_heartbeat {
            node.last_heartbeat = sent_at;
            if heartbeat.system_stats.is_some() {
                node.system_stats = heartbeat.system_stats;
            }
            if heartbeat.metrics.is_some() {
                node.agent_metrics = heartbeat.metrics;
            }
            if heartbeat.current_load.is_some() {
                node.current_load = heartbeat.current_load;
            }
        }

        node.consecutive_failures = 0;
        reliability::refresh(&mut node, self.config.degrade_floor, false);

        let status = node.status();
        let revivable = matches!(
            status,
            NodeStatus::Pending | NodeStatus::Stale | NodeStatus::Offline
        );
        if revivable && !node.heartbeat_expired(now, self.config.heartbeat_ttl()) {
            let from = node.transition(NodeStatus::Active)?;
            tracing::info!(node_id = %node.node_id, from = %from, "Node recovered on heartbeat");
            self.emit(FleetEvent::NodeRecovered {
                node_id: node.node_id.clone(),
                from,
            });
            // Liveness does not clear a score below the floor.
            let change = reliability::refresh(&mut node, self.config.degrade_floor, false);
            self.emit_reliability_change(&node, change);
        }

        let ack = HeartbeatAck {
            accepted: true,
            node_id: node.node_id.clone(),
            status: node.status(),
            next_heartbeat_sec: self.config.next_heartbeat_secs(),
        };
        store.upsert(node);
        Ok(ack)
    }

    /// Apply a worker's completion report.
    ///
    /// Returns `false` when the task held no reservation on that node, which
    /// covers duplicate reports and reservations already force-released.
    pub async fn report_completion(&self, completion: TaskCompletion) -> Result<bool> {
        let now = self.clock.now();
        let success = completion.status == crate::routing::CompletionStatus::Completed;

        {
            let mut store = self.store.write().await;
            let Some(mut node) = store.get(&completion.node_id) else {
                tracing::warn!(node_id = %completion.node_id, task_id = %completion.task_id, "Completion from unknown node");
                return Err(FleetError::NodeUnknown(completion.node_id));
            };

            if !node.slots.release(&completion.task_id) {
                tracing::debug!(
                    node_id = %completion.node_id,
                    task_id = %completion.task_id,
                    "Completion for task without reservation, ignoring"
                );
                return Ok(false);
            }

            let change = if success {
                reliability::record_success(&mut node, completion.duration_ms);
                reliability::refresh(&mut node, self.config.degrade_floor, true)
            } else {
                reliability::record_failure(&mut node);
                reliability::refresh(&mut node, self.config.degrade_floor, false)
            };
            self.emit_reliability_change(&node, change);

            tracing::info!(
                node_id = %node.node_id,
                task_id = %completion.task_id,
                status = %completion.status,
                duration_ms = completion.duration_ms,
                reliability = node.reliability_score,
                "Task completed"
            );
            store.upsert(node);
        }

        self.history.write().await.finish(
            &completion.task_id,
            completion.status.into(),
            Some(completion.duration_ms),
            now,
        );
        self.metrics.task_finished(success);
        self.emit(FleetEvent::TaskCompleted {
            task_id: completion.task_id,
            node_id: completion.node_id,
            status: completion.status,
            duration_ms: completion.duration_ms,
        });
        Ok(true)
    }

    /// Delete a node. Its in-flight tasks are marked abandoned in history.
    pub async fn remove_node(&self, node_id: &str) -> Result<NodeSummary> {
        let removed = self
            .store
            .write()
            .await
            .delete(node_id)
            .ok_or_else(|| FleetError::NodeUnknown(node_id.to_string()))?;

        let now = self.clock.now();
        let in_flight = removed.slots.task_ids();
        if !in_flight.is_empty() {
            let mut history = self.history.write().await;
            for task_id in in_flight {
                history.finish(task_id, HistoryStatus::Abandoned, None, now);
            }
        }

        self.metrics.removals.fetch_add(1, Ordering::Relaxed);
        tracing::info!(node_id = %node_id, "Node removed");
        self.emit(FleetEvent::NodeRemoved {
            node_id: node_id.to_string(),
        });
        Ok(removed.summary())
    }

    pub async fn get_node(&self, node_id: &str) -> Option<NodeSummary> {
        self.store.read().await.get(node_id).map(|n| n.summary())
    }

    pub async fn list_nodes(&self, filter: &NodeFilter) -> Vec<NodeSummary> {
        self.store
            .read()
            .await
            .list()
            .iter()
            .filter(|n| filter.matches(n))
            .map(NodeRecord::summary)
            .collect()
    }

    /// Most recent `limit` routed tasks, oldest first.
    pub async fn task_history(&self, limit: usize) -> Vec<TaskHistoryEntry> {
        self.history.read().await.recent(limit)
    }

    /// Run matching and ranking for `task_type` without reserving anything.
    pub async fn can_handle_task(&self, task_type: &str) -> CapabilityCheck {
        let profile = self.profiles.resolve(task_type);
        let now = self.clock.now();
        let nodes = self.store.read().await.list();
        let criteria = self.match_criteria(&profile, None, now);
        let eligible = find_eligible(&nodes, &criteria);
        let ranked = rank(&eligible, &profile, &self.config.weights);

        CapabilityCheck {
            task_type: task_type.to_string(),
            can_handle: !ranked.is_empty(),
            eligible_nodes: ranked.len(),
            best_node: ranked.into_iter().next(),
            requirements: profile,
        }
    }

    pub async fn cluster_state(&self) -> ClusterState {
        let nodes = self.store.read().await.list();

        let mut by_status: BTreeMap<String, usize> = NodeStatus::ALL
            .iter()
            .map(|s| (s.to_string(), 0))
            .collect();
        let mut by_tier: BTreeMap<String, usize> = [Tier::Light, Tier::Standard, Tier::Powerhouse]
            .iter()
            .map(|t| (t.to_string(), 0))
            .collect();
        let mut capacity = ComputeCapacity::default();
        let mut reliability_sum = 0u64;

        for node in &nodes {
            *by_status.entry(node.status().to_string()).or_default() += 1;
            *by_tier.entry(node.tier.to_string()).or_default() += 1;
            reliability_sum += node.reliability_score as u64;

            if node.status() == NodeStatus::Active {
                capacity.total_cores += node.hardware.cpu_cores as u64;
                capacity.total_ram_gb += node.hardware.ram_gb;
                if node.hardware.has_gpu() {
                    capacity.gpu_nodes += 1;
                    capacity.total_gpu_vram_gb += node.hardware.gpu_vram_gb;
                }
                capacity.total_slots += node.max_concurrent;
                capacity.used_slots += node.slots.len();
            }
        }
        capacity.available_slots = capacity.total_slots.saturating_sub(capacity.used_slots);
        if capacity.total_slots > 0 {
            capacity.utilization_pct = round1(
                capacity.used_slots as f64 / capacity.total_slots as f64 * 100.0,
            );
        }

        let avg_reliability = if nodes.is_empty() {
            0.0
        } else {
            round1(reliability_sum as f64 / nodes.len() as f64)
        };

        ClusterState {
            total_nodes: nodes.len(),
            by_status,
            by_tier,
            capacity,
            avg_reliability,
            metrics: self.metrics.snapshot(),
            health_monitoring: self.health_monitoring(),
            heartbeat_ttl_secs: self.config.heartbeat_ttl_secs,
            task_routing: self.profiles.routing_map(),
            timestamp: self.clock.now(),
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
