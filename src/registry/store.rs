use std::collections::HashMap;

use crate::registry::node::NodeRecord;

/// Repository of node records. Callers serialize access through one lock.
pub trait NodeStore: Send + Sync {
    fn get(&self, node_id: &str) -> Option<NodeRecord>;

    /// Insert or replace, returning the previous record.
    fn upsert(&mut self, record: NodeRecord) -> Option<NodeRecord>;

    /// All records in registration order.
    fn list(&self) -> Vec<NodeRecord>;

    fn delete(&mut self, node_id: &str) -> Option<NodeRecord>;

    fn len(&self) -> usize {
        self.list().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Map-backed store for a single router process.
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    nodes: HashMap<String, NodeRecord>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for InMemoryNodeStore {
    fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.get(node_id).cloned()
    }

    fn upsert(&mut self, record: NodeRecord) -> Option<NodeRecord> {
        self.nodes.insert(record.node_id.clone(), record)
    }

    fn list(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    fn delete(&mut self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.remove(node_id)
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HardwareProfile, NodeStatus};
    use chrono::Utc;

    fn record(id: &str, seq: u64) -> NodeRecord {
        let mut r = NodeRecord::new(
            id.into(),
            id.into(),
            format!("http://{id}"),
            "local".into(),
            HardwareProfile::new(4, 8.0),
            vec![],
            vec![],
            16,
            NodeStatus::Active,
            Utc::now(),
        );
        r.seq = seq;
        r
    }

    #[test]
    fn list_keeps_registration_order() {
        let mut store = InMemoryNodeStore::new();
        store.upsert(record("c", 3));
        store.upsert(record("a", 1));
        store.upsert(record("b", 2));
        let ids: Vec<String> = store.list().into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn upsert_replaces_and_delete_removes() {
        let mut store = InMemoryNodeStore::new();
        assert!(store.upsert(record("a", 1)).is_none());
        assert!(store.upsert(record("a", 1)).is_some());
        assert_eq!(store.len(), 1);
        assert!(store.delete("a").is_some());
        assert!(store.delete("a").is_none());
        assert!(store.is_empty());
    }
}
