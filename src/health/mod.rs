//! Heartbeat ageing and active probing.
//!
//! The rules here are pure functions of a node and the current time. The
//! [`HealthSupervisor`] applies them to the whole fleet on a timer.

pub mod supervisor;

pub use supervisor::{HealthSupervisor, SweepReport};

use chrono::{DateTime, Utc};

use crate::registry::{NodeRecord, NodeStatus};

/// Heartbeat age, in TTLs, after which a node is declared offline.
pub const OFFLINE_AFTER_TTLS: i32 = 5;

/// What the heartbeat-age rule says about a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeVerdict {
    Fresh,
    Expired,
    Gone,
}

pub fn age_verdict(node: &NodeRecord, now: DateTime<Utc>, ttl: chrono::Duration) -> AgeVerdict {
    if node.heartbeat_expired(now, ttl * OFFLINE_AFTER_TTLS) {
        AgeVerdict::Gone
    } else if node.heartbeat_expired(now, ttl) {
        AgeVerdict::Expired
    } else {
        AgeVerdict::Fresh
    }
}

/// Status the age rule moves a node to, if any.
pub fn age_transition(status: NodeStatus, verdict: AgeVerdict) -> Option<NodeStatus> {
    match (status, verdict) {
        (NodeStatus::Offline, _) => None,
        (_, AgeVerdict::Gone) => Some(NodeStatus::Offline),
        (NodeStatus::Active, AgeVerdict::Expired) => Some(NodeStatus::Stale),
        _ => None,
    }
}

/// Nodes whose heartbeat is current get an out-of-band probe, unless they
/// are offline or degraded.
pub fn should_probe(status: NodeStatus, verdict: AgeVerdict) -> bool {
    verdict == AgeVerdict::Fresh
        && matches!(
            status,
            NodeStatus::Active | NodeStatus::Stale | NodeStatus::Pending | NodeStatus::Unhealthy
        )
}

/// Status after a successful probe, if it changes.
pub fn probe_success_transition(status: NodeStatus) -> Option<NodeStatus> {
    match status {
        NodeStatus::Stale | NodeStatus::Pending | NodeStatus::Unhealthy => Some(NodeStatus::Active),
        _ => None,
    }
}

/// Status after a failed probe given the failure streak, if it changes.
pub fn probe_failure_transition(
    status: NodeStatus,
    probe_failures: u32,
    threshold: u32,
) -> Option<NodeStatus> {
    match status {
        NodeStatus::Active | NodeStatus::Stale if probe_failures >= threshold => {
            Some(NodeStatus::Unhealthy)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HardwareProfile;
    use chrono::Duration;

    fn node_seen_at(at: DateTime<Utc>) -> NodeRecord {
        NodeRecord::new(
            "n".into(),
            "n".into(),
            "http://n".into(),
            "local".into(),
            HardwareProfile::default(),
            vec![],
            vec![],
            16,
            NodeStatus::Active,
            at,
        )
    }

    #[test]
    fn verdict_thresholds() {
        let start = Utc::now();
        let node = node_seen_at(start);
        let ttl = Duration::seconds(120);
        assert_eq!(age_verdict(&node, start + Duration::seconds(119), ttl), AgeVerdict::Fresh);
        assert_eq!(age_verdict(&node, start + Duration::seconds(121), ttl), AgeVerdict::Expired);
        assert_eq!(age_verdict(&node, start + Duration::seconds(601), ttl), AgeVerdict::Gone);
    }

    #[test]
    fn only_active_goes_stale() {
        assert_eq!(
            age_transition(NodeStatus::Active, AgeVerdict::Expired),
            Some(NodeStatus::Stale)
        );
        assert_eq!(age_transition(NodeStatus::Degraded, AgeVerdict::Expired), None);
        assert_eq!(age_transition(NodeStatus::Pending, AgeVerdict::Expired), None);
    }

    #[test]
    fn everything_but_offline_goes_offline() {
        for status in NodeStatus::ALL {
            let expected = (status != NodeStatus::Offline).then_some(NodeStatus::Offline);
            assert_eq!(age_transition(status, AgeVerdict::Gone), expected);
        }
    }

    #[test]
    fn expired_nodes_are_not_probed() {
        assert!(should_probe(NodeStatus::Active, AgeVerdict::Fresh));
        assert!(!should_probe(NodeStatus::Active, AgeVerdict::Expired));
        assert!(!should_probe(NodeStatus::Degraded, AgeVerdict::Fresh));
        assert!(!should_probe(NodeStatus::Offline, AgeVerdict::Fresh));
    }

    #[test]
    fn probe_failures_escalate_at_threshold() {
        assert_eq!(probe_failure_transition(NodeStatus::Active, 2, 3), None);
        assert_eq!(
            probe_failure_transition(NodeStatus::Active, 3, 3),
            Some(NodeStatus::Unhealthy)
        );
        assert_eq!(probe_failure_transition(NodeStatus::Pending, 9, 3), None);
    }
}
