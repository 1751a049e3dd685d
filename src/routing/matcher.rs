use chrono::{DateTime, Utc};

use crate::registry::NodeRecord;
use crate::routing::profile::RequirementProfile;

const GPU_TAG: &str = "gpu";

/// Inputs of the eligibility filter for one task.
#[derive(Debug, Clone)]
pub struct MatchCriteria<'a> {
    pub profile: &'a RequirementProfile,
    /// Preferred tags that must be satisfied, not just scored.
    pub hard_tags: &'a [String],
    pub preferred_node: Option<&'a str>,
    pub now: DateTime<Utc>,
    pub heartbeat_ttl: chrono::Duration,
}

/// Whether `node` carries `tag`. The gpu tag is also satisfied by a declared GPU.
pub fn satisfies_tag(node: &NodeRecord, tag: &str) -> bool {
    node.has_capability(tag) || (tag.eq_ignore_ascii_case(GPU_TAG) && node.hardware.has_gpu())
}

/// Hard-gated preferences of `profile` that `node` cannot meet.
fn fails_hard_gate(node: &NodeRecord, criteria: &MatchCriteria<'_>) -> bool {
    criteria
        .hard_tags
        .iter()
        .filter(|tag| criteria.profile.prefers_tag(tag))
        .any(|tag| {
            if tag.eq_ignore_ascii_case(GPU_TAG) {
                !node.hardware.has_gpu()
            } else {
                !node.has_capability(tag)
            }
        })
}

pub fn is_eligible(node: &NodeRecord, criteria: &MatchCriteria<'_>) -> bool {
    if !node.status().is_routable() {
        return false;
    }
    if node.heartbeat_expired(criteria.now, criteria.heartbeat_ttl) {
        return false;
    }
    if !node.has_free_slot() {
        return false;
    }
    if node.hardware.cpu_cores < criteria.profile.min_cores {
        return false;
    }
    if node.hardware.ram_gb < criteria.profile.min_ram_gb {
        return false;
    }
    if fails_hard_gate(node, criteria) {
        return false;
    }
    if let Some(preferred) = criteria.preferred_node {
        if preferred != node.node_id {
            return false;
        }
    }
    true
}

/// Nodes passing status, freshness, capacity and capability filters, in
/// registration order.
pub fn find_eligible<'n>(nodes: &'n [NodeRecord], criteria: &MatchCriteria<'_>) -> Vec<&'n NodeRecord> {
    nodes.iter().filter(|n| is_eligible(n, criteria)).collect()
}
