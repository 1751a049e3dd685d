use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::events::FleetEvent;
use crate::fleet::FleetManager;
use crate::health::{
    age_transition, age_verdict, probe_failure_transition, probe_success_transition,
    should_probe,
};
use crate::history::HistoryStatus;
use crate::registry::NodeStatus;
use crate::reliability;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: Vec<String>,
    pub offline: Vec<String>,
    pub probed: usize,
    pub recovered: Vec<String>,
    pub unhealthy: Vec<String>,
    /// (task_id, node_id) of force-released reservations.
    pub expired_reservations: Vec<(String, String)>,
}

/// Owns the periodic health sweep of a fleet.
pub struct HealthSupervisor {
    fleet: Arc<FleetManager>,
}

impl HealthSupervisor {
    pub fn new(fleet: Arc<FleetManager>) -> Self {
        Self { fleet }
    }

    /// Run [`sweep`](Self::sweep) every `health_check_interval` until `cancel`
    /// fires. A sweep in progress finishes before the task exits.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.fleet.config().health_check_interval();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            self.fleet.set_health_monitoring(true);
            tracing::info!(interval_secs = period.as_secs(), "Health monitoring started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.sweep().await;
                        tracing::debug!(
                            probed = report.probed,
                            stale = report.stale.len(),
                            offline = report.offline.len(),
                            unhealthy = report.unhealthy.len(),
                            recovered = report.recovered.len(),
                            expired_reservations = report.expired_reservations.len(),
                            "Health sweep finished"
                        );
                    }
                }
            }

            self.fleet.set_health_monitoring(false);
            tracing::info!("Health monitoring stopped");
        })
    }

    /// One pass over the fleet.
    ///
    /// 1. Apply the heartbeat-age rule and force-release expired reservations.
    /// 2. Probe every node with a current heartbeat, concurrently and with the
    ///    registry unlocked. Each probe has its own timeout.
    /// 3. Apply probe results.
    pub async fn sweep(&self) -> SweepReport {
        let fleet = &self.fleet;
        let config = fleet.config();
        let ttl = config.heartbeat_ttl();
        let now = fleet.clock.now();
        let mut report = SweepReport::default();
        let mut targets = Vec::new();

        {
            let mut store = fleet.store.write().await;
            for mut node in store.list() {
                let verdict = age_verdict(&node, now, ttl);

                if let Some(next) = age_transition(node.status(), verdict) {
                    if node.transition(next).is_ok() {
                        let age = node.heartbeat_age_secs(now);
                        if next == NodeStatus::Offline {
                            tracing::warn!(node_id = %node.node_id, heartbeat_age_secs = age, "Node offline");
                            fleet.emit(FleetEvent::NodeOffline {
                                node_id: node.node_id.clone(),
                            });
                            report.offline.push(node.node_id.clone());
                        } else {
                            tracing::warn!(node_id = %node.node_id, heartbeat_age_secs = age, "Node heartbeat expired");
                            fleet.emit(FleetEvent::NodeStale {
                                node_id: node.node_id.clone(),
                                heartbeat_age_secs: age,
                            });
                            report.stale.push(node.node_id.clone());
                        }
                    }
                }

                let expired = node.slots.expired(now, config.reservation_timeout());
                if !expired.is_empty() {
                    for reservation in &expired {
                        node.slots.release(&reservation.task_id);
                        reliability::record_failure(&mut node);
                        tracing::warn!(
                            node_id = %node.node_id,
                            task_id = %reservation.task_id,
                            reserved_at = %reservation.reserved_at,
                            "Reservation expired without completion"
                        );
                        report
                            .expired_reservations
                            .push((reservation.task_id.clone(), node.node_id.clone()));
                    }
                    let change = reliability::refresh(&mut node, config.degrade_floor, false);
                    fleet.emit_reliability_change(&node, change);
                }

                if should_probe(node.status(), verdict) {
                    targets.push((node.node_id.clone(), node.address.clone()));
                }
                store.upsert(node);
            }
        }

        if !report.expired_reservations.is_empty() {
            let mut history = fleet.history.write().await;
            for (task_id, node_id) in &report.expired_reservations {
                history.finish(task_id, HistoryStatus::Expired, None, now);
                fleet.metrics.reservation_expired();
                fleet.metrics.task_finished(false);
                fleet.emit(FleetEvent::ReservationExpired {
                    task_id: task_id.clone(),
                    node_id: node_id.clone(),
                });
            }
        }

        report.probed = targets.len();
        let probe_timeout = config.probe_timeout();
        let results = join_all(targets.into_iter().map(|(node_id, address)| async move {
            let healthy = matches!(
                tokio::time::timeout(
                    probe_timeout,
                    fleet.transport.probe_health(&address, probe_timeout),
                )
                .await,
                Ok(Ok(()))
            );
            (node_id, healthy)
        }))
        .await;

        if results.is_empty() {
            return report;
        }

        let mut store = fleet.store.write().await;
        for (node_id, healthy) in results {
            // Removed while the probe was in flight.
            let Some(mut node) = store.get(&node_id) else {
                continue;
            };

            if healthy {
                node.consecutive_probe_failures = 0;
                if let Some(next) = probe_success_transition(node.status()) {
                    if let Ok(from) = node.transition(next) {
                        tracing::info!(node_id = %node_id, from = %from, "Node recovered after probe");
                        fleet.emit(FleetEvent::NodeRecovered {
                            node_id: node_id.clone(),
                            from,
                        });
                        report.recovered.push(node_id.clone());
                        let change =
                            reliability::refresh(&mut node, config.degrade_floor, false);
                        fleet.emit_reliability_change(&node, change);
                    }
                }
            } else {
                node.consecutive_probe_failures = node.consecutive_probe_failures.saturating_add(1);
                tracing::debug!(
                    node_id = %node_id,
                    probe_failures = node.consecutive_probe_failures,
                    "Health probe failed"
                );
                if let Some(next) = probe_failure_transition(
                    node.status(),
                    node.consecutive_probe_failures,
                    config.unhealthy_probe_threshold,
                ) {
                    if node.transition(next).is_ok() {
                        tracing::warn!(
                            node_id = %node_id,
                            probe_failures = node.consecutive_probe_failures,
                            "Node unhealthy"
                        );
                        fleet.emit(FleetEvent::NodeUnhealthy {
                            node_id: node_id.clone(),
                            probe_failures: node.consecutive_probe_failures,
                        });
                        report.unhealthy.push(node_id.clone());
                    }
                }
            }
            store.upsert(node);
        }

        report
    }
}
