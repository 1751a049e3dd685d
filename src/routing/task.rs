use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task priority. P0 tasks get the longer dispatch timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::P0 => write!(f, "P0"),
            Priority::P1 => write!(f, "P1"),
            Priority::P2 => write!(f, "P2"),
            Priority::P3 => write!(f, "P3"),
        }
    }
}

fn default_task_type() -> String {
    "general".to_string()
}

/// A task to be placed on one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub preferred_node: Option<String>,
    /// Set once failover has been attempted for this task.
    #[serde(rename = "_retried", default)]
    pub retried: bool,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: format!("task-{}", Uuid::new_v4()),
            task_type: task_type.into(),
            priority: Priority::default(),
            payload: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            preferred_node: None,
            retried: false,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_preferred_node(mut self, node_id: impl Into<String>) -> Self {
        self.preferred_node = Some(node_id.into());
        self
    }

    /// Fill in an id when the caller left it blank.
    pub(crate) fn ensure_id(&mut self) {
        if self.id.trim().is_empty() {
            self.id = format!("task-{}", Uuid::new_v4());
        }
    }
}

/// Body sent to a worker's task endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: String,
    pub task_type: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub source_cloud: String,
    pub timeout_ms: u64,
}

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionStatus::Completed => write!(f, "completed"),
            CompletionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Completion callback from a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: String,
    pub node_id: String,
    pub status: CompletionStatus,
    #[serde(default)]
    pub duration_ms: u64,
}
