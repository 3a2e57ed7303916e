use crate::error::IngestError;
use crate::graph::{Node, Relationship};
use crate::settings::Settings;
use crate::store::GraphStore;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Graph store backed by Neo4j's transactional HTTP endpoint. Every
/// write is a single-statement MERGE transaction.
pub struct Neo4jStore {
    client: reqwest::Client,
    commit_url: String,
    user: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct CypherResponse {
    #[serde(default)]
    results: Vec<CypherResult>,
    #[serde(default)]
    errors: Vec<CypherError>,
}

#[derive(Debug, Deserialize)]
struct CypherResult {
    #[serde(default)]
    data: Vec<CypherRow>,
}

#[derive(Debug, Deserialize)]
struct CypherRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct CypherError {
    code: String,
    message: String,
}

impl Neo4jStore {
    pub fn new(settings: &Settings) -> Self {
        let base = settings.neo4j_uri.trim_end_matches('/');
        Neo4jStore {
            client: reqwest::Client::new(),
            commit_url: format!("{base}/db/{}/tx/commit", settings.neo4j_database),
            user: settings.neo4j_user.clone(),
            password: settings.neo4j_password.clone(),
        }
    }

    async fn execute(
        &self,
        statement: &str,
        parameters: Value,
    ) -> Result<Vec<CypherRow>, IngestError> {
        let payload = json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });

        let response = self
            .client
            .post(&self.commit_url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&payload)
            .send()
            .await
            .map_err(|e| IngestError::Persistence(format!("neo4j request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Persistence(format!(
                "neo4j returned HTTP {status}"
            )));
        }

        let body: CypherResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Persistence(format!("invalid neo4j response: {e}")))?;

        if let Some(err) = body.errors.first() {
            return Err(IngestError::Persistence(format!(
                "{}: {}",
                err.code, err.message
            )));
        }

        Ok(body.results.into_iter().flat_map(|r| r.data).collect())
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn upsert_node(&self, node: &Node) -> Result<(), IngestError> {
        let labels = node.labels.join(":");
        let statement = format!("MERGE (n:{labels} {{id: $id}}) SET n += $props");
        let params = json!({
            "id": node.id,
            "props": serialize_properties(&node.properties),
        });
        self.execute(&statement, params).await.map(|_| ())
    }

    async fn upsert_relationship(&self, rel: &Relationship) -> Result<(), IngestError> {
        let set_clause = if rel.properties.is_empty() {
            ""
        } else {
            "SET r += $props"
        };
        let statement = format!(
            "MATCH (a {{id: $source_id}}) MATCH (b {{id: $target_id}}) \
             MERGE (a)-[r:{}]->(b) {set_clause}",
            rel.rel_type
        );
        let mut params = json!({
            "source_id": rel.source_id,
            "target_id": rel.target_id,
        });
        if !rel.properties.is_empty() {
            params["props"] = Value::Object(serialize_properties(&rel.properties));
        }
        self.execute(&statement, params).await.map(|_| ())
    }

    async fn node_counts(&self) -> Result<HashMap<String, u64>, IngestError> {
        let rows = self
            .execute(
                "MATCH (n) UNWIND labels(n) AS label RETURN label, count(*) AS total",
                json!({}),
            )
            .await?;
        Ok(count_rows(rows))
    }

    async fn relationship_counts(&self) -> Result<HashMap<String, u64>, IngestError> {
        let rows = self
            .execute(
                "MATCH ()-[r]->() RETURN type(r) AS rel_type, count(*) AS total",
                json!({}),
            )
            .await?;
        Ok(count_rows(rows))
    }

    async fn clear(&self) -> Result<(), IngestError> {
        self.execute("MATCH (n) DETACH DELETE n", json!({}))
            .await
            .map(|_| ())
    }
}

fn count_rows(rows: Vec<CypherRow>) -> HashMap<String, u64> {
    rows.into_iter()
        .filter_map(|r| {
            let key = r.row.first()?.as_str()?.to_string();
            let count = r.row.get(1)?.as_u64()?;
            Some((key, count))
        })
        .collect()
}

/// The store cannot hold nested structures as node properties, so
/// object and list values are stored as JSON text.
fn serialize_properties(props: &Map<String, Value>) -> Map<String, Value> {
    props
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::Object(_) | Value::Array(_) => (k.clone(), Value::String(v.to_string())),
            scalar => (k.clone(), scalar.clone()),
        })
        .collect()
}
