use serde::{Deserialize, Serialize};

use crate::config::ScoringWeights;
use crate::registry::NodeRecord;
use crate::routing::matcher::satisfies_tag;
use crate::routing::profile::RequirementProfile;

/// A scored candidate. The ranked list keeps its full order for failover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub node_id: String,
    pub address: String,
    pub score: f64,
}

/// Weighted routing score of `node` for `profile`. Higher is better.
pub fn score(node: &NodeRecord, profile: &RequirementProfile, weights: &ScoringWeights) -> f64 {
    let mut score = 0.0;

    if !profile.prefers.is_empty() {
        let matched = profile
            .prefers
            .iter()
            .filter(|tag| satisfies_tag(node, tag))
            .count();
        score += matched as f64 / profile.prefers.len() as f64 * weights.capability;
    }

    let core_ratio =
        (node.hardware.cpu_cores as f64 / profile.min_cores.max(1) as f64).min(weights.headroom_cap);
    let ram_ratio = (node.hardware.ram_gb / profile.min_ram_gb.max(1.0)).min(weights.headroom_cap);
    score += (core_ratio + ram_ratio) * weights.headroom;

    score += node.tier.priority_boost() * weights.tier;

    score -= node.utilization() * weights.load;

    score += node.reliability_score as f64 / 100.0 * weights.reliability;

    if node.tasks_completed > weights.latency_min_samples && node.avg_task_duration_ms > 0.0 {
        let bonus = weights.latency_max - node.avg_task_duration_ms / weights.latency_ms_per_point;
        score += bonus.max(0.0);
    }

    if let Some(stats) = &node.system_stats {
        let cpu_free = (100.0 - stats.cpu_usage_pct.unwrap_or(50.0)).clamp(0.0, 100.0);
        let ram_free = (100.0 - stats.ram_usage_pct.unwrap_or(50.0)).clamp(0.0, 100.0);
        score += (cpu_free + ram_free) / weights.freshness_divisor;
    }

    score
}

/// Score and order candidates, best first. Equal scores keep input order.
pub fn rank(
    candidates: &[&NodeRecord],
    profile: &RequirementProfile,
    weights: &ScoringWeights,
) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .iter()
        .map(|node| RankedCandidate {
            node_id: node.node_id.clone(),
            address: node.address.clone(),
            score: score(node, profile, weights),
        })
        .collect();
    // sort_by is stable
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}
