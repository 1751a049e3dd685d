use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Hardware minimums and preferred capability tags for one task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementProfile {
    pub min_cores: u32,
    pub min_ram_gb: f64,
    #[serde(default)]
    pub prefers: Vec<String>,
    #[serde(default)]
    pub label: String,
}

impl RequirementProfile {
    pub fn new(min_cores: u32, min_ram_gb: f64, prefers: &[&str], label: &str) -> Self {
        Self {
            min_cores,
            min_ram_gb,
            prefers: prefers.iter().map(|s| s.to_string()).collect(),
            label: label.to_string(),
        }
    }

    /// Profile for task types with no entry in the table.
    pub fn fallback() -> Self {
        Self::new(1, 1.0, &[], "General")
    }

    pub fn prefers_tag(&self, tag: &str) -> bool {
        self.prefers.iter().any(|p| p.eq_ignore_ascii_case(tag))
    }
}

/// Task type to requirement profile lookup.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: HashMap<String, RequirementProfile>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        let builtin = [
            ("build", RequirementProfile::new(4, 4.0, &["docker", "node"], "Build")),
            ("test", RequirementProfile::new(2, 2.0, &["node", "docker"], "Test")),
            ("lint", RequirementProfile::new(1, 1.0, &["node"], "Lint")),
            ("security", RequirementProfile::new(2, 2.0, &["node"], "Security Audit")),
            ("deployment", RequirementProfile::new(2, 4.0, &["docker", "git"], "Deployment")),
            ("site-gen", RequirementProfile::new(2, 2.0, &["node"], "Site Generation")),
            ("drift", RequirementProfile::new(1, 1.0, &["git"], "Drift Detection")),
            ("verify", RequirementProfile::new(1, 1.0, &[], "Verification")),
            ("checkpoint", RequirementProfile::new(1, 1.0, &["git"], "Checkpoint")),
            ("ai_inference", RequirementProfile::new(8, 16.0, &["python", "gpu"], "AI Inference")),
            ("data_process", RequirementProfile::new(4, 8.0, &["python"], "Data Processing")),
            ("batch_job", RequirementProfile::new(4, 8.0, &["docker"], "Batch Job")),
            ("indexing", RequirementProfile::new(2, 4.0, &["node"], "Indexing")),
            ("backup", RequirementProfile::new(1, 2.0, &["storage"], "Backup")),
        ];
        Self {
            profiles: builtin
                .into_iter()
                .map(|(name, profile)| (name.to_string(), profile))
                .collect(),
        }
    }
}

impl ProfileTable {
    /// Built-in table with `overrides` replacing or adding entries.
    pub fn with_overrides(overrides: &HashMap<String, RequirementProfile>) -> Self {
        let mut table = Self::default();
        for (name, profile) in overrides {
            let mut profile = profile.clone();
            if profile.label.is_empty() {
                profile.label = name.clone();
            }
            table.profiles.insert(name.clone(), profile);
        }
        table
    }

    /// Requirements for `task_type`, or the minimal fallback when unknown.
    pub fn resolve(&self, task_type: &str) -> RequirementProfile {
        self.profiles
            .get(task_type)
            .cloned()
            .unwrap_or_else(RequirementProfile::fallback)
    }

    /// Task type to label, sorted by task type.
    pub fn routing_map(&self) -> BTreeMap<String, String> {
        self.profiles
            .iter()
            .map(|(name, p)| (name.clone(), p.label.clone()))
            .collect()
    }
}
