pub mod classifier;
pub mod error;
pub mod graph;
pub mod http;
pub mod loader;
pub mod mapper;
pub mod neo4j;
pub mod rules;
pub mod sequencer;
pub mod server;
pub mod settings;
pub mod store;

pub use error::IngestError;
pub use graph::{GraphData, Node, Relationship};
pub use http::{parse_request, parse_response, HttpRequest, HttpResponse};
pub use loader::{GraphLoader, GraphStatistics, LoadResult, LoadStats};
pub use mapper::GraphMapper;
pub use neo4j::Neo4jStore;
pub use rules::{RuleConfig, RuleSet};
pub use sequencer::TemporalSequencer;
pub use settings::Settings;
pub use store::{GraphStore, MemoryStore};
