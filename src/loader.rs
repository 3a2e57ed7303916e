use crate::error::IngestError;
use crate::http::{parse_request, HttpRequest};
use crate::mapper::GraphMapper;
use crate::rules::RuleSet;
use crate::sequencer::TemporalSequencer;
use crate::store::GraphStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Counts for one successfully loaded request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LoadResult {
    pub nodes_created: usize,
    pub relationships_created: usize,
}

/// Aggregate over a batch; per-item failures are recorded and the
/// batch keeps going.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub total_requests: usize,
    pub loaded_count: usize,
    pub failed_count: usize,
    pub total_nodes: usize,
    pub total_relationships: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStatistics {
    pub nodes: HashMap<String, u64>,
    pub relationships: HashMap<String, u64>,
}

/// Drives the whole per-request pipeline: map the parsed request to a
/// draft graph, merge it into the store, then chain it into the
/// per-user temporal sequence.
pub struct GraphLoader {
    mapper: GraphMapper,
    store: Arc<dyn GraphStore>,
    sequencer: TemporalSequencer,
}

impl GraphLoader {
    pub fn new(rules: Arc<RuleSet>, store: Arc<dyn GraphStore>) -> Self {
        GraphLoader {
            mapper: GraphMapper::new(rules),
            store,
            sequencer: TemporalSequencer::new(),
        }
    }

    /// Re-read the rule document this loader's rules were loaded from.
    pub fn reload_rules(&mut self) -> Result<(), IngestError> {
        let rules = self.mapper.rules().reload()?;
        self.mapper = GraphMapper::new(Arc::new(rules));
        log::info!("Rules reloaded");
        Ok(())
    }

    /// Ingest one raw HTTP request blob with an optional caller
    /// timestamp: parse, map, persist.
    pub async fn ingest(&self, raw: &str, timestamp: &str) -> Result<LoadResult, IngestError> {
        let request = parse_request(raw, timestamp)?;
        self.load_request(&request).await
    }

    /// Map and persist a single parsed request. Nodes are merged
    /// first; a node failure aborts before any relationship that would
    /// reference it. The FOLLOWS edge is added last, only after the
    /// request's own graph is fully persisted.
    pub async fn load_request(&self, request: &HttpRequest) -> Result<LoadResult, IngestError> {
        let graph = self.mapper.map_request(request)?;

        let mut nodes_created = 0;
        let mut relationships_created = 0;

        for node in &graph.nodes {
            self.store.upsert_node(node).await?;
            nodes_created += 1;
        }
        for rel in &graph.relationships {
            self.store.upsert_relationship(rel).await?;
            relationships_created += 1;
        }

        if let (Some(request_node), Some(user_node)) =
            (graph.find_by_label("Request"), graph.find_by_label("User"))
        {
            let timestamp = request_node
                .properties
                .get("timestamp")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            // Keyed by the content-addressed User node id, so the
            // chain follows the resolved identity.
            if let Some(follows) = self
                .sequencer
                .advance(&user_node.id, &request_node.id, timestamp)
            {
                self.store.upsert_relationship(&follows).await?;
                relationships_created += 1;
            }
        }

        log::debug!(
            "Loaded request {} {}: {nodes_created} nodes, {relationships_created} relationships",
            request.method,
            request.path
        );

        Ok(LoadResult {
            nodes_created,
            relationships_created,
        })
    }

    /// Load many requests, recording per-item errors without aborting
    /// the rest of the batch.
    pub async fn load_requests(&self, requests: &[HttpRequest]) -> LoadStats {
        let mut stats = LoadStats {
            total_requests: requests.len(),
            ..Default::default()
        };

        log::info!("Starting to load {} requests", requests.len());

        for (idx, request) in requests.iter().enumerate() {
            match self.load_request(request).await {
                Ok(result) => {
                    stats.loaded_count += 1;
                    stats.total_nodes += result.nodes_created;
                    stats.total_relationships += result.relationships_created;
                }
                Err(e) => {
                    stats.failed_count += 1;
                    let msg = format!("Failed to load request {}: {e}", idx + 1);
                    log::error!("{msg}");
                    stats.errors.push(msg);
                }
            }
        }

        log::info!(
            "Loading complete: {} successful, {} failed",
            stats.loaded_count,
            stats.failed_count
        );
        stats
    }

    pub async fn statistics(&self) -> Result<GraphStatistics, IngestError> {
        Ok(GraphStatistics {
            nodes: self.store.node_counts().await?,
            relationships: self.store.relationship_counts().await?,
        })
    }

    /// Administrative: wipe the whole graph.
    pub async fn clear_graph(&self) -> Result<(), IngestError> {
        self.store.clear().await?;
        log::info!("Graph cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, Relationship};
    use crate::rules::RuleConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loader_with_store() -> (GraphLoader, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let rules = Arc::new(RuleSet::compile(RuleConfig::default()));
        (GraphLoader::new(rules, store.clone()), store)
    }

    fn jwt_for(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    fn raw_request(path: &str, user: &str) -> String {
        let token = jwt_for(serde_json::json!({"sub": user}));
        format!("GET {path} HTTP/1.1\r\nHost: api.test\r\nAuthorization: Bearer {token}\r\n\r\n")
    }

    #[tokio::test]
    async fn test_endpoint_deduplicated_across_ingests() {
        let (loader, store) = loader_with_store();
        for i in 0..3 {
            let raw = format!("GET /api/users/{i} HTTP/1.1\r\nHost: api.test\r\n\r\n");
            loader
                .ingest(&raw, &format!("2024-03-01T10:00:0{i}Z"))
                .await
                .unwrap();
        }

        assert_eq!(store.nodes_with_label("Endpoint").len(), 1);
        assert_eq!(store.nodes_with_label("Request").len(), 3);
        assert_eq!(store.relationships_of_type("TARGETS").len(), 3);
    }

    #[tokio::test]
    async fn test_follows_chain_for_identified_user() {
        let (loader, store) = loader_with_store();
        loader
            .ingest(&raw_request("/api/users/42", "42"), "2024-03-01T10:00:00Z")
            .await
            .unwrap();
        loader
            .ingest(&raw_request("/api/orders/7", "42"), "2024-03-01T10:01:30Z")
            .await
            .unwrap();

        let follows = store.relationships_of_type("FOLLOWS");
        assert_eq!(follows.len(), 1);
        assert_eq!(follows[0].properties["time_delta"], 90);
        assert_eq!(store.nodes_with_label("User").len(), 1);
    }

    #[tokio::test]
    async fn test_no_follows_without_identity() {
        let (loader, store) = loader_with_store();
        for _ in 0..2 {
            loader
                .ingest("GET /api/items HTTP/1.1\r\nHost: x\r\n\r\n", "")
                .await
                .unwrap();
        }
        assert!(store.relationships_of_type("FOLLOWS").is_empty());
    }

    #[tokio::test]
    async fn test_reingest_duplicates_request_but_not_entities() {
        let (loader, store) = loader_with_store();
        let raw = raw_request("/api/users/42", "42");
        loader.ingest(&raw, "2024-03-01T10:00:00Z").await.unwrap();
        loader.ingest(&raw, "2024-03-01T10:00:00Z").await.unwrap();

        assert_eq!(store.nodes_with_label("Request").len(), 2);
        assert_eq!(store.nodes_with_label("Endpoint").len(), 1);
        assert_eq!(store.nodes_with_label("User").len(), 1);
        assert_eq!(store.nodes_with_label("Resource").len(), 1);
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures() {
        let (loader, _store) = loader_with_store();
        let good = parse_request("GET /api/users/1 HTTP/1.1\r\nHost: ok\r\n\r\n", "").unwrap();
        let mut bad = good.clone();
        // A Host that cannot form a valid URL fails the mapping stage.
        bad.headers.insert("Host".to_string(), "bad host".to_string());

        let stats = loader
            .load_requests(&[good.clone(), bad, good.clone()])
            .await;
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.loaded_count, 2);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].contains("request 2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_user_one_follows_edge() {
        let store = Arc::new(MemoryStore::new());
        let rules = Arc::new(RuleSet::compile(RuleConfig::default()));
        let loader = Arc::new(GraphLoader::new(rules, store.clone()));

        let l1 = loader.clone();
        let l2 = loader.clone();
        let t1 = tokio::spawn(async move {
            l1.ingest(&raw_request("/api/users/42", "42"), "2024-03-01T10:00:00Z")
                .await
        });
        let t2 = tokio::spawn(async move {
            l2.ingest(&raw_request("/api/users/42", "42"), "2024-03-01T10:00:05Z")
                .await
        });
        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let follows = store.relationships_of_type("FOLLOWS");
        assert_eq!(follows.len(), 1);
        assert_eq!(follows[0].properties["time_delta"], 5);

        // The edge direction matches the timestamps.
        let requests = store.nodes_with_label("Request");
        let earlier = requests
            .iter()
            .find(|r| r.properties["timestamp"] == "2024-03-01T10:00:00Z")
            .unwrap();
        assert_eq!(follows[0].source_id, earlier.id);
    }

    /// Store that rejects every node write, to check that no
    /// relationship is created for a request whose nodes failed.
    struct FailingStore {
        relationship_writes: AtomicUsize,
    }

    #[async_trait]
    impl GraphStore for FailingStore {
        async fn upsert_node(&self, _node: &Node) -> Result<(), IngestError> {
            Err(IngestError::Persistence("store down".to_string()))
        }
        async fn upsert_relationship(&self, _rel: &Relationship) -> Result<(), IngestError> {
            self.relationship_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn node_counts(&self) -> Result<HashMap<String, u64>, IngestError> {
            Ok(HashMap::new())
        }
        async fn relationship_counts(&self) -> Result<HashMap<String, u64>, IngestError> {
            Ok(HashMap::new())
        }
        async fn clear(&self) -> Result<(), IngestError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_node_failure_blocks_dependent_relationships() {
        let store = Arc::new(FailingStore {
            relationship_writes: AtomicUsize::new(0),
        });
        let rules = Arc::new(RuleSet::compile(RuleConfig::default()));
        let loader = GraphLoader::new(rules, store.clone());

        let err = loader
            .ingest(&raw_request("/api/users/42", "42"), "")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Persistence(_)));
        assert_eq!(store.relationship_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parse_error_surfaces() {
        let (loader, _store) = loader_with_store();
        let err = loader.ingest("BROKEN", "").await.unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
    }

    #[tokio::test]
    async fn test_statistics_and_clear() {
        let (loader, _store) = loader_with_store();
        loader
            .ingest(&raw_request("/api/users/42", "42"), "")
            .await
            .unwrap();

        let stats = loader.statistics().await.unwrap();
        assert_eq!(stats.nodes["Endpoint"], 1);
        assert!(stats.relationships["TARGETS"] >= 1);

        loader.clear_graph().await.unwrap();
        let stats = loader.statistics().await.unwrap();
        assert!(stats.nodes.is_empty());
    }
}
