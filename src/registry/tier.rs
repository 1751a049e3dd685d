use serde::{Deserialize, Serialize};

use crate::registry::node::HardwareProfile;

/// Coarse hardware class. Only used as a ranking bonus, never as a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Light,
    Standard,
    Powerhouse,
}

impl Tier {
    pub fn classify(hardware: &HardwareProfile) -> Tier {
        let cores = hardware.cpu_cores;
        let ram = hardware.ram_gb;
        if cores >= 12 && ram >= 24.0 {
            Tier::Powerhouse
        } else if cores >= 4 && ram >= 8.0 {
            Tier::Standard
        } else {
            Tier::Light
        }
    }

    /// Concurrent task slots: half a core and 2GB per task, capped by `ceiling`.
    pub fn max_concurrent(hardware: &HardwareProfile, ceiling: usize) -> usize {
        let by_cores = (hardware.cpu_cores / 2) as usize;
        let by_ram = (hardware.ram_gb.max(0.0) / 2.0).floor() as usize;
        by_cores.min(by_ram).min(ceiling).max(1)
    }

    pub fn priority_boost(self) -> f64 {
        match self {
            Tier::Powerhouse => 0.3,
            Tier::Standard => 0.1,
            Tier::Light => 0.0,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Light => write!(f, "light"),
            Tier::Standard => write!(f, "standard"),
            Tier::Powerhouse => write!(f, "powerhouse"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = crate::error::FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(Tier::Light),
            "standard" => Ok(Tier::Standard),
            "powerhouse" => Ok(Tier::Powerhouse),
            other => Err(crate::error::FleetError::Config(format!(
                "unknown tier: {other}"
            ))),
        }
    }
}
