use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::routing::profile::RequirementProfile;

/// Largest accepted value of any `*_secs` setting (30 days).
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 3600;

/// Weights of the candidate scoring function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Multiplier for the fraction of preferred tags a node carries.
    pub capability: f64,
    /// Multiplier for the capped core and RAM headroom ratios.
    pub headroom: f64,
    /// Upper bound of each headroom ratio.
    pub headroom_cap: f64,
    /// Multiplier for the tier priority boost.
    pub tier: f64,
    /// Multiplier for the utilization penalty.
    pub load: f64,
    /// Multiplier for reliability_score / 100.
    pub reliability: f64,
    /// Largest latency bonus a fast node can earn.
    pub latency_max: f64,
    /// Average duration (ms) that costs one point of latency bonus.
    pub latency_ms_per_point: f64,
    /// Completed tasks needed before the latency bonus applies.
    pub latency_min_samples: u64,
    /// Divisor applied to (cpu free % + ram free %).
    pub freshness_divisor: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capability: 30.0,
            headroom: 5.0,
            headroom_cap: 4.0,
            tier: 20.0,
            load: 25.0,
            reliability: 15.0,
            latency_max: 10.0,
            latency_ms_per_point: 10_000.0,
            latency_min_samples: 5,
            freshness_divisor: 20.0,
        }
    }
}

/// Router configuration. Every field has a default so a partial TOML file
/// only needs the values it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Address of the HTTP API.
    pub listen_addr: SocketAddr,
    /// Label sent to workers with each dispatched task.
    pub source_cloud: String,
    /// Heartbeat age after which an active node becomes stale. Five times
    /// this marks it offline.
    pub heartbeat_ttl_secs: u64,
    /// Period of the health sweep.
    pub health_check_interval_secs: u64,
    /// Task history entries kept before the oldest are dropped.
    pub max_task_history: usize,
    pub registration_probe_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub dispatch_timeout_secs: u64,
    /// Dispatch timeout for P0 tasks.
    pub critical_dispatch_timeout_secs: u64,
    /// Upper bound on concurrent task slots of any node.
    pub capacity_ceiling: usize,
    /// Reliability below which an active node is degraded.
    pub degrade_floor: u8,
    /// Consecutive failed probes that mark a node unhealthy.
    pub unhealthy_probe_threshold: u32,
    /// Reservations older than this are force-released as failures.
    pub reservation_timeout_secs: u64,
    /// Keep reliability counters when a node registers again.
    pub preserve_reliability_on_reregister: bool,
    /// Preferred tags that act as hard filters. "gpu" matches a declared GPU.
    pub hard_filter_tags: Vec<String>,
    pub weights: ScoringWeights,
    /// Entries merged over the built-in task profile table.
    pub task_profiles: HashMap<String, RequirementProfile>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8420)),
            source_cloud: "fleet-router".to_string(),
            heartbeat_ttl_secs: 120,
            health_check_interval_secs: 30,
            max_task_history: 5000,
            registration_probe_timeout_secs: 10,
            probe_timeout_secs: 5,
            dispatch_timeout_secs: 60,
            critical_dispatch_timeout_secs: 300,
            capacity_ceiling: 16,
            degrade_floor: 30,
            unhealthy_probe_threshold: 3,
            reservation_timeout_secs: 1800,
            preserve_reliability_on_reregister: true,
            hard_filter_tags: vec!["gpu".to_string()],
            weights: ScoringWeights::default(),
            task_profiles: HashMap::new(),
        }
    }
}

impl FleetConfig {
    /// Load a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FleetError::Config(format!("{}: {}", path.display(), e)))?;
        let config: FleetConfig =
            toml::from_str(&raw).map_err(|e| FleetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("heartbeat_ttl_secs", self.heartbeat_ttl_secs),
            ("health_check_interval_secs", self.health_check_interval_secs),
            (
                "registration_probe_timeout_secs",
                self.registration_probe_timeout_secs,
            ),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("dispatch_timeout_secs", self.dispatch_timeout_secs),
            (
                "critical_dispatch_timeout_secs",
                self.critical_dispatch_timeout_secs,
            ),
            ("reservation_timeout_secs", self.reservation_timeout_secs),
        ];
        for (name, secs) in durations {
            if secs == 0 || secs > MAX_DURATION_SECS {
                return Err(FleetError::Config(format!(
                    "{name} must be between 1 and {MAX_DURATION_SECS}, got {secs}"
                )));
            }
        }
        if self.max_task_history == 0 {
            return Err(FleetError::Config("max_task_history must be > 0".into()));
        }
        if self.capacity_ceiling == 0 {
            return Err(FleetError::Config("capacity_ceiling must be > 0".into()));
        }
        if self.degrade_floor > 100 {
            return Err(FleetError::Config("degrade_floor must be <= 100".into()));
        }
        Ok(())
    }

    pub fn with_heartbeat_ttl(mut self, secs: u64) -> Self {
        self.heartbeat_ttl_secs = secs;
        self
    }

    pub fn with_profile(mut self, task_type: &str, profile: RequirementProfile) -> Self {
        self.task_profiles.insert(task_type.to_string(), profile);
        self
    }

    // Clamped so an unvalidated config cannot overflow chrono arithmetic.
    pub fn heartbeat_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_ttl_secs.min(MAX_DURATION_SECS) as i64)
    }

    pub fn reservation_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_timeout_secs.min(MAX_DURATION_SECS) as i64)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn registration_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_probe_timeout_secs)
    }

    /// Suggested heartbeat period handed back to workers.
    pub fn next_heartbeat_secs(&self) -> u64 {
        (self.heartbeat_ttl_secs / 2).max(1)
    }
}
