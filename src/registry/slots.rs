use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// A task occupying one concurrency slot on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub task_id: String,
    pub reserved_at: DateTime<Utc>,
}

/// Concurrency slots of one node. Never holds more than `capacity` entries.
#[derive(Debug, Clone, Default)]
pub struct SlotLedger {
    reservations: HashMap<String, Reservation>,
    capacity: usize,
}

impl SlotLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            reservations: HashMap::new(),
            capacity,
        }
    }

    /// Take a slot for `task_id`. Returns false when full or already held.
    pub fn reserve(&mut self, task_id: &str, now: DateTime<Utc>) -> bool {
        if self.reservations.len() >= self.capacity || self.reservations.contains_key(task_id) {
            return false;
        }
        self.reservations.insert(
            task_id.to_string(),
            Reservation {
                task_id: task_id.to_string(),
                reserved_at: now,
            },
        );
        true
    }

    /// Free the slot held by `task_id`. A second release is a no-op returning false.
    pub fn release(&mut self, task_id: &str) -> bool {
        self.reservations.remove(task_id).is_some()
    }

    /// Reservations older than `timeout`, oldest first.
    pub fn expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<Reservation> {
        let mut expired: Vec<Reservation> = self
            .reservations
            .values()
            .filter(|r| now - r.reserved_at >= timeout)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.reserved_at);
        expired
    }

    /// Drop every reservation, returning the task ids that were held.
    pub fn clear(&mut self) -> Vec<String> {
        self.reservations.drain().map(|(id, _)| id).collect()
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.reservations.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}
