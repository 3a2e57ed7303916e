use crate::error::IngestError;
use crate::graph::{Node, Relationship};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// The four operations the pipeline needs from a graph store: merge a
/// node by id, merge a typed edge, aggregate counts, and the
/// administrative clear. All writes are idempotent merges.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Merge a node by id, then overwrite its properties.
    async fn upsert_node(&self, node: &Node) -> Result<(), IngestError>;

    /// Merge the typed edge between two node ids, setting relationship
    /// properties when present.
    async fn upsert_relationship(&self, rel: &Relationship) -> Result<(), IngestError>;

    /// Node counts grouped by label.
    async fn node_counts(&self) -> Result<HashMap<String, u64>, IngestError>;

    /// Relationship counts grouped by type.
    async fn relationship_counts(&self) -> Result<HashMap<String, u64>, IngestError>;

    /// Destructive: remove every node and relationship.
    async fn clear(&self) -> Result<(), IngestError>;
}

/// Mutex-guarded in-memory store with the same merge semantics as the
/// real backend. Used by tests and demo mode.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryGraph>,
}

#[derive(Default)]
struct MemoryGraph {
    nodes: HashMap<String, Node>,
    // Keyed by (source, type, target): merging the same edge twice
    // must not duplicate it.
    relationships: HashMap<(String, String, String), Relationship>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.inner.lock().unwrap().nodes.get(id).cloned()
    }

    pub fn nodes_with_label(&self, label: &str) -> Vec<Node> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.has_label(label))
            .cloned()
            .collect()
    }

    pub fn relationships_of_type(&self, rel_type: &str) -> Vec<Relationship> {
        self.inner
            .lock()
            .unwrap()
            .relationships
            .values()
            .filter(|r| r.rel_type == rel_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn upsert_node(&self, node: &Node) -> Result<(), IngestError> {
        let mut graph = self.inner.lock().unwrap();
        match graph.nodes.get_mut(&node.id) {
            Some(existing) => {
                for (k, v) in &node.properties {
                    existing.properties.insert(k.clone(), v.clone());
                }
            }
            None => {
                graph.nodes.insert(node.id.clone(), node.clone());
            }
        }
        Ok(())
    }

    async fn upsert_relationship(&self, rel: &Relationship) -> Result<(), IngestError> {
        let mut graph = self.inner.lock().unwrap();
        let key = (
            rel.source_id.clone(),
            rel.rel_type.clone(),
            rel.target_id.clone(),
        );
        match graph.relationships.get_mut(&key) {
            Some(existing) => {
                for (k, v) in &rel.properties {
                    existing.properties.insert(k.clone(), v.clone());
                }
            }
            None => {
                graph.relationships.insert(key, rel.clone());
            }
        }
        Ok(())
    }

    async fn node_counts(&self) -> Result<HashMap<String, u64>, IngestError> {
        let graph = self.inner.lock().unwrap();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for node in graph.nodes.values() {
            for label in &node.labels {
                *counts.entry(label.clone()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    async fn relationship_counts(&self) -> Result<HashMap<String, u64>, IngestError> {
        let graph = self.inner.lock().unwrap();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for rel in graph.relationships.values() {
            *counts.entry(rel.rel_type.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn clear(&self) -> Result<(), IngestError> {
        let mut graph = self.inner.lock().unwrap();
        graph.nodes.clear();
        graph.relationships.clear();
        Ok(())
    }
}
