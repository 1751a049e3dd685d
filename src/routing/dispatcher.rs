use std::time::Duration;

use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::events::FleetEvent;
use crate::fleet::FleetManager;
use crate::history::{HistoryStatus, TaskHistoryEntry};
use crate::registry::{NodeStatus, Tier};
use crate::reliability;
use crate::routing::matcher::{find_eligible, is_eligible};
use crate::routing::profile::RequirementProfile;
use crate::routing::ranker::{rank, RankedCandidate};
use crate::routing::task::{DispatchRequest, Priority, TaskRequest};
use crate::transport::DispatchAck;

/// Hint returned with an unrouted task: the caller may run it elsewhere.
pub const CLOUD_FALLBACK: &str = "cloud";

/// A task accepted by a worker.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedTask {
    pub task_id: String,
    pub node_id: String,
    pub node_name: String,
    pub tier: Tier,
    pub score: f64,
    /// 1, or 2 when the first choice failed and failover succeeded.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Wire form of a routing decision, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub routed: bool,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<&'static str>,
}

impl RouteOutcome {
    pub fn from_result(task_id: &str, result: &Result<RoutedTask>) -> Self {
        match result {
            Ok(routed) => Self {
                routed: true,
                task_id: routed.task_id.clone(),
                node_id: Some(routed.node_id.clone()),
                node_name: Some(routed.node_name.clone()),
                tier: Some(routed.tier),
                score: Some(routed.score),
                attempts: Some(routed.attempts),
                reason: None,
                code: None,
                fallback: None,
            },
            Err(e) => Self {
                routed: false,
                task_id: task_id.to_string(),
                node_id: None,
                node_name: None,
                tier: None,
                score: None,
                attempts: None,
                reason: Some(e.to_string()),
                code: Some(e.code()),
                fallback: matches!(
                    e,
                    FleetError::NoEligibleNodes { .. } | FleetError::DispatchFailed { .. }
                )
                .then_some(CLOUD_FALLBACK),
            },
        }
    }
}

/// Slot held on a node while its dispatch is in flight.
struct Reserved {
    address: String,
    node_name: String,
    tier: Tier,
}

impl FleetManager {
    /// Place `task` on the best eligible node.
    ///
    /// The top candidate's slot is reserved before the dispatch call. If that
    /// dispatch fails and the task has not been retried yet, the second
    /// candidate of the same ranking gets exactly one more attempt.
    pub async fn route_task(&self, mut task: TaskRequest) -> Result<RoutedTask> {
        task.ensure_id();
        let profile = self.profiles.resolve(&task.task_type);
        let (ranked, active_nodes) = self.rank_for(&task, &profile).await;

        let Some(first) = ranked.first() else {
            tracing::warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                active_nodes,
                "No eligible nodes for task"
            );
            return Err(FleetError::NoEligibleNodes {
                task_type: task.task_type,
                active_nodes,
            });
        };

        let first_error = match self.attempt(&task, &profile, first).await {
            Ok(routed) => return Ok(routed),
            Err(e) => e,
        };

        let second = match ranked.get(1) {
            Some(second) if !task.retried => second,
            _ => {
                return Err(FleetError::DispatchFailed {
                    node_id: first.node_id.clone(),
                    reason: first_error.to_string(),
                })
            }
        };

        task.retried = true;
        self.metrics.failover();
        tracing::warn!(
            task_id = %task.id,
            from = %first.node_id,
            to = %second.node_id,
            error = %first_error,
            "Dispatch failed, failing over"
        );
        self.emit(FleetEvent::TaskFailover {
            task_id: task.id.clone(),
            from: first.node_id.clone(),
            to: second.node_id.clone(),
        });

        match self.attempt(&task, &profile, second).await {
            Ok(mut routed) => {
                routed.attempts = 2;
                Ok(routed)
            }
            Err(e) => Err(FleetError::DispatchFailed {
                node_id: second.node_id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Ranked eligible candidates and the number of active nodes.
    async fn rank_for(
        &self,
        task: &TaskRequest,
        profile: &RequirementProfile,
    ) -> (Vec<RankedCandidate>, usize) {
        let now = self.clock.now();
        let nodes = self.store.read().await.list();
        let active = nodes
            .iter()
            .filter(|n| n.status() == NodeStatus::Active)
            .count();
        let criteria = self.match_criteria(profile, task.preferred_node.as_deref(), now);
        let eligible = find_eligible(&nodes, &criteria);
        (rank(&eligible, profile, &self.config.weights), active)
    }

    /// Reserve, dispatch, and settle one attempt against `candidate`.
    async fn attempt(
        &self,
        task: &TaskRequest,
        profile: &RequirementProfile,
        candidate: &RankedCandidate,
    ) -> Result<RoutedTask> {
        let reserved = self.reserve(task, profile, &candidate.node_id).await?;

        let timeout = self.dispatch_timeout(task.priority);
        let request = DispatchRequest {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
            payload: task.payload.clone(),
            metadata: task.metadata.clone(),
            source_cloud: self.config.source_cloud.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let message = match self.send(&reserved.address, &request, timeout).await {
            Ok(ack) => ack.message,
            Err(e) => {
                if self
                    .settle_dispatch_failure(&candidate.node_id, &task.id, &e)
                    .await
                {
                    return Err(e);
                }
                None
            }
        };

        self.metrics.task_routed();
        tracing::info!(
            task_id = %task.id,
            task_type = %task.task_type,
            node_id = %candidate.node_id,
            tier = %reserved.tier,
            score = candidate.score,
            "Task routed"
        );
        self.emit(FleetEvent::TaskRouted {
            task_id: task.id.clone(),
            node_id: candidate.node_id.clone(),
            task_type: task.task_type.clone(),
        });
        Ok(RoutedTask {
            task_id: task.id.clone(),
            node_id: candidate.node_id.clone(),
            node_name: reserved.node_name,
            tier: reserved.tier,
            score: candidate.score,
            attempts: 1,
            message,
        })
    }

    /// Take a slot on `node_id`, re-checking eligibility under the write lock
    /// since the ranking was computed under an earlier read.
    ///
    /// The history entry is written in the same critical section, so a
    /// completion that beats the dispatch acknowledgement still finds it.
    async fn reserve(
        &self,
        task: &TaskRequest,
        profile: &RequirementProfile,
        node_id: &str,
    ) -> Result<Reserved> {
        let now = self.clock.now();
        let mut store = self.store.write().await;
        let mut node = store
            .get(node_id)
            .ok_or_else(|| FleetError::NodeUnknown(node_id.to_string()))?;

        let criteria = self.match_criteria(profile, task.preferred_node.as_deref(), now);
        if !is_eligible(&node, &criteria) {
            return Err(FleetError::Transport(format!(
                "node {node_id} is no longer eligible"
            )));
        }
        if !node.slots.reserve(&task.id, now) {
            return Err(FleetError::Transport(format!(
                "node {node_id} already holds task {}",
                task.id
            )));
        }

        let reserved = Reserved {
            address: node.address.clone(),
            node_name: node.name.clone(),
            tier: node.tier,
        };
        self.history.write().await.push(TaskHistoryEntry {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
            node_id: node_id.to_string(),
            routed_at: now,
            status: HistoryStatus::Dispatched,
            duration_ms: None,
            completed_at: None,
        });
        store.upsert(node);
        Ok(reserved)
    }

    /// Dispatch with the caller-side timeout. A timeout or a refused task
    /// counts as a transport failure.
    async fn send(
        &self,
        address: &str,
        request: &DispatchRequest,
        timeout: Duration,
    ) -> Result<DispatchAck> {
        match tokio::time::timeout(
            timeout,
            self.transport.dispatch_task(address, request, timeout),
        )
        .await
        {
            Ok(Ok(ack)) if ack.accepted => Ok(ack),
            Ok(Ok(ack)) => Err(FleetError::Transport(format!(
                "task refused: {}",
                ack.message.unwrap_or_else(|| "no reason given".to_string())
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FleetError::Transport(format!(
                "dispatch timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Release the slot of a failed dispatch and charge the node for it.
    ///
    /// Returns false when the slot is already gone: the worker reported the
    /// task before the dispatch call errored, so the task did reach it.
    async fn settle_dispatch_failure(
        &self,
        node_id: &str,
        task_id: &str,
        error: &FleetError,
    ) -> bool {
        let mut store = self.store.write().await;
        let Some(mut node) = store.get(node_id) else {
            return true;
        };
        if !node.slots.release(task_id) {
            tracing::warn!(
                node_id = %node_id,
                task_id = %task_id,
                error = %error,
                "Dispatch errored after the task was already reported"
            );
            return false;
        }
        self.history.write().await.retract(task_id);
        reliability::record_dispatch_failure(&mut node);
        let change = reliability::refresh(&mut node, self.config.degrade_floor, false);
        tracing::warn!(
            node_id = %node_id,
            task_id = %task_id,
            error = %error,
            consecutive_failures = node.consecutive_failures,
            reliability = node.reliability_score,
            "Dispatch failed"
        );
        self.emit_reliability_change(&node, change);
        store.upsert(node);
        true
    }

    fn dispatch_timeout(&self, priority: Priority) -> Duration {
        let secs = match priority {
            Priority::P0 => self.config.critical_dispatch_timeout_secs,
            _ => self.config.dispatch_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrouted_outcome_carries_fallback() {
        let err: Result<RoutedTask> = Err(FleetError::NoEligibleNodes {
            task_type: "build".into(),
            active_nodes: 0,
        });
        let outcome = RouteOutcome::from_result("t1", &err);
        assert!(!outcome.routed);
        assert_eq!(outcome.fallback, Some(CLOUD_FALLBACK));
        assert_eq!(outcome.code, Some("NO_ELIGIBLE_NODES"));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["routed"], false);
        assert!(json.get("node_id").is_none());
    }

    #[test]
    fn routed_outcome_has_node() {
        let ok: Result<RoutedTask> = Ok(RoutedTask {
            task_id: "t1".into(),
            node_id: "n1".into(),
            node_name: "box".into(),
            tier: Tier::Standard,
            score: 42.0,
            attempts: 1,
            message: None,
        });
        let outcome = RouteOutcome::from_result("t1", &ok);
        assert!(outcome.routed);
        assert_eq!(outcome.node_id.as_deref(), Some("n1"));
        assert!(outcome.fallback.is_none());
    }
}
