use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::routing::{CompletionStatus, Priority};

const DEFAULT_MAX_ENTRIES: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Dispatched,
    Completed,
    Failed,
    /// Reservation timed out without a completion report.
    Expired,
    /// The node re-registered while the task was in flight.
    Abandoned,
}

impl From<CompletionStatus> for HistoryStatus {
    fn from(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Completed => HistoryStatus::Completed,
            CompletionStatus::Failed => HistoryStatus::Failed,
        }
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryStatus::Dispatched => write!(f, "dispatched"),
            HistoryStatus::Completed => write!(f, "completed"),
            HistoryStatus::Failed => write!(f, "failed"),
            HistoryStatus::Expired => write!(f, "expired"),
            HistoryStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub task_type: String,
    pub priority: Priority,
    pub node_id: String,
    pub routed_at: DateTime<Utc>,
    pub status: HistoryStatus,
    pub duration_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Bounded, append-only log of routed tasks. Diagnostic only.
#[derive(Debug)]
pub struct TaskHistory {
    entries: VecDeque<TaskHistoryEntry>,
    max_entries: usize,
}

impl Default for TaskHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Append an entry, dropping the oldest ones past capacity.
    pub fn push(&mut self, entry: TaskHistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Record the terminal state of the latest entry for `task_id`.
    /// Returns false if the entry has already been dropped.
    pub fn finish(
        &mut self,
        task_id: &str,
        status: HistoryStatus,
        duration_ms: Option<u64>,
        at: DateTime<Utc>,
    ) -> bool {
        match self.entries.iter_mut().rev().find(|e| e.task_id == task_id) {
            Some(entry) => {
                entry.status = status;
                entry.duration_ms = duration_ms;
                entry.completed_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Drop the latest entry for `task_id` if it is still `dispatched`.
    /// Used when the dispatch that created it never reached the worker.
    pub fn retract(&mut self, task_id: &str) -> bool {
        let position = self
            .entries
            .iter()
            .rposition(|e| e.task_id == task_id && e.status == HistoryStatus::Dispatched);
        match position {
            Some(index) => self.entries.remove(index).is_some(),
            None => false,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskHistoryEntry> {
        self.entries.iter().rev().find(|e| e.task_id == task_id)
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<TaskHistoryEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
