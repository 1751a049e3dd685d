//! Reliability scoring and the demotion it drives.
//!
//! The score is a pure function of a node's counters. [`refresh`] is the
//! only code path that moves a node into [`NodeStatus::Degraded`].

use crate::registry::{NodeRecord, NodeStatus};

const MAX_PENALTY: u32 = 50;
const PENALTY_PER_FAILURE: u32 = 10;

/// Score in 0..=100 from completion history and the current failure streak.
pub fn compute_score(completed: u64, failed: u64, consecutive_failures: u32) -> u8 {
    let total = completed + failed;
    let base = if total == 0 {
        100.0
    } else {
        completed as f64 / total as f64 * 100.0
    };
    let penalty = consecutive_failures
        .saturating_mul(PENALTY_PER_FAILURE)
        .min(MAX_PENALTY) as f64;
    (base - penalty).round().clamp(0.0, 100.0) as u8
}

/// What a reliability refresh did to a node's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityChange {
    Unchanged,
    Degraded,
    Restored,
}

/// Recompute `node.reliability_score` and apply floor crossings.
///
/// An active node below `floor` becomes degraded. A degraded node climbs back
/// to active only when `allow_restore` is set, which callers do for
/// successful completions.
pub fn refresh(node: &mut NodeRecord, floor: u8, allow_restore: bool) -> ReliabilityChange {
    node.reliability_score = compute_score(
        node.tasks_completed,
        node.tasks_failed,
        node.consecutive_failures,
    );

    match node.status() {
        NodeStatus::Active if node.reliability_score < floor => {
            if node.transition(NodeStatus::Degraded).is_ok() {
                tracing::warn!(
                    node_id = %node.node_id,
                    reliability = node.reliability_score,
                    "Node degraded below reliability floor"
                );
                return ReliabilityChange::Degraded;
            }
            ReliabilityChange::Unchanged
        }
        NodeStatus::Degraded if allow_restore && node.reliability_score >= floor => {
            if node.transition(NodeStatus::Active).is_ok() {
                tracing::info!(
                    node_id = %node.node_id,
                    reliability = node.reliability_score,
                    "Node restored to active pool"
                );
                return ReliabilityChange::Restored;
            }
            ReliabilityChange::Unchanged
        }
        _ => ReliabilityChange::Unchanged,
    }
}

/// Fold a successful completion into the node's counters.
pub fn record_success(node: &mut NodeRecord, duration_ms: u64) {
    node.tasks_completed += 1;
    node.total_task_duration_ms = node.total_task_duration_ms.saturating_add(duration_ms);
    node.avg_task_duration_ms =
        node.total_task_duration_ms as f64 / node.tasks_completed.max(1) as f64;
    node.consecutive_failures = 0;
}

/// Fold a failed completion into the node's counters.
pub fn record_failure(node: &mut NodeRecord) {
    node.tasks_failed += 1;
    node.consecutive_failures = node.consecutive_failures.saturating_add(1);
}

/// A dispatch that never reached the worker. Counts against the streak only.
pub fn record_dispatch_failure(node: &mut NodeRecord) {
    node.consecutive_failures = node.consecutive_failures.saturating_add(1);
    node.failure_count += 1;
}
