use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One draft graph node. The same shape is produced for every entity
/// kind; labels carry the entity kind plus its classified type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

impl Node {
    pub fn new(id: String, labels: Vec<&str>) -> Self {
        Node {
            id,
            labels: labels.into_iter().map(String::from).collect(),
            properties: Map::new(),
        }
    }

    pub fn prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// One draft directed relationship between two node ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    pub rel_type: String,
    pub properties: Map<String, Value>,
}

impl Relationship {
    pub fn new(source_id: &str, target_id: &str, rel_type: &str) -> Self {
        Relationship {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            rel_type: rel_type.to_string(),
            properties: Map::new(),
        }
    }

    pub fn prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// The in-memory node/relationship set produced for one request,
/// before persistence.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphData {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
}

impl GraphData {
    pub fn find_by_label(&self, label: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.has_label(label))
    }
}

/// Content-addressed identifier: identical logical entities always map
/// to the same id, so repeated occurrences merge onto one node.
/// Used for Endpoint, User, and Resource nodes.
pub fn content_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{hex}")
}

/// Instance-addressed identifier: unique per occurrence, never merged.
/// Used for Request, Parameter, Header, Body, and BodyField nodes.
pub fn instance_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
