use crate::classifier;
use crate::error::IngestError;
use crate::graph::{content_id, instance_id, GraphData, Node, Relationship};
use crate::http::{endpoint_pattern, Body, HttpRequest};
use crate::rules::RuleSet;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// JSON body fields are expanded recursively; fields deeper than this
/// are silently ignored.
const MAX_FIELD_DEPTH: usize = 5;

/// Values stored on Parameter/Header/BodyField nodes are truncated to
/// this length.
const MAX_VALUE_LEN: usize = 100;

/// Builds the draft graph for one parsed request by running the
/// classifier over every element of the message.
pub struct GraphMapper {
    rules: Arc<RuleSet>,
}

impl GraphMapper {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        GraphMapper { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Map a request into its complete node/relationship set:
    /// request, parameters, headers, body and nested fields, endpoint,
    /// user, and resources. Nothing partial escapes a failure.
    pub fn map_request(&self, request: &HttpRequest) -> Result<GraphData, IngestError> {
        let url = Url::parse(&request.url())
            .map_err(|e| IngestError::Mapping(format!("invalid URL {:?}: {e}", request.url())))?;
        let path = url.path().to_string();
        let query_pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut graph = GraphData::default();

        let request_node = self.request_node(request);
        let request_id = request_node.id.clone();
        graph.nodes.push(request_node);

        self.map_parameters(&mut graph, &request_id, &query_pairs);
        self.map_headers(&mut graph, &request_id, request);
        self.map_body(&mut graph, &request_id, request);
        self.map_endpoint(&mut graph, &request_id, request, &url, &path);
        self.map_user(&mut graph, &request_id, request);
        self.map_resources(&mut graph, &request_id, request, &path, &query_pairs);

        log::debug!(
            "Mapped {} {}: {} nodes, {} relationships",
            request.method,
            path,
            graph.nodes.len(),
            graph.relationships.len()
        );
        Ok(graph)
    }

    fn labels<'a>(&'a self, entity: &'a str, extra: Option<&'a str>) -> Vec<&'a str> {
        let mut labels = vec![entity];
        if let Some(extra) = extra {
            labels.push(extra);
        }
        labels.extend(self.rules.additional_labels(entity).iter().map(|s| s.as_str()));
        labels
    }

    fn request_node(&self, request: &HttpRequest) -> Node {
        let protocol = if request.version.is_empty() {
            "HTTP/1.1"
        } else {
            &request.version
        };
        Node::new(instance_id("request"), self.labels("Request", None))
            .prop("method", request.method.as_str())
            .prop("url", request.url())
            .prop("timestamp", request.timestamp.as_str())
            .prop("protocol", protocol)
    }

    fn map_parameters(
        &self,
        graph: &mut GraphData,
        request_id: &str,
        query_pairs: &[(String, String)],
    ) {
        // Occurrence index is per parameter name so repeated keys stay
        // distinguishable.
        let mut occurrence: HashMap<&str, usize> = HashMap::new();

        for (name, value) in query_pairs {
            let idx = occurrence.entry(name.as_str()).or_insert(0);
            let class = classifier::classify_parameter(&self.rules, name);

            let node = Node::new(
                instance_id("param"),
                self.labels("Parameter", Some(&class.param_type)),
            )
            .prop("name", name.as_str())
            .prop("value", truncate(value))
            .prop("type", class.param_type.as_str())
            .prop("risk", class.risk.as_str())
            .prop("location", "query");

            graph.relationships.push(
                Relationship::new(request_id, &node.id, "HAS_PARAMETER")
                    .prop("position", *idx)
                    .prop("required", false),
            );
            graph.nodes.push(node);
            *idx += 1;
        }
    }

    fn map_headers(&self, graph: &mut GraphData, request_id: &str, request: &HttpRequest) {
        let mut names: Vec<&String> = request.headers.keys().collect();
        names.sort();

        for (idx, name) in names.into_iter().enumerate() {
            // Headers outside every configured category are dropped.
            let Some(category) = classifier::classify_header(&self.rules, name) else {
                continue;
            };
            let value = &request.headers[name];
            let display_value = if category.is_sensitive {
                "[redacted]".to_string()
            } else {
                truncate(value)
            };

            let node = Node::new(
                instance_id("header"),
                self.labels("Header", Some(&category.category)),
            )
            .prop("name", name.as_str())
            .prop("value", display_value)
            .prop("category", category.category.as_str())
            .prop("is_sensitive", category.is_sensitive);

            graph.relationships.push(
                Relationship::new(request_id, &node.id, "HAS_HEADER").prop("order", idx),
            );
            graph.nodes.push(node);
        }
    }

    fn map_body(&self, graph: &mut GraphData, request_id: &str, request: &HttpRequest) {
        let Some(body) = &request.body else {
            return;
        };

        let content_type = request.header("Content-Type").unwrap_or("unknown");
        let body_text = body.as_text();
        let node = Node::new(instance_id("body"), self.labels("Body", None))
            .prop("content_type", content_type)
            .prop("size", body_text.len())
            .prop("encoding", body.encoding());
        let body_id = node.id.clone();

        graph.relationships.push(
            Relationship::new(request_id, &body_id, "HAS_BODY").prop("encoding", body.encoding()),
        );
        graph.nodes.push(node);

        if let Body::Json(Value::Object(map)) = body {
            self.map_body_fields(graph, &body_id, map, "", 0);
        }
    }

    fn map_body_fields(
        &self,
        graph: &mut GraphData,
        parent_id: &str,
        fields: &serde_json::Map<String, Value>,
        prefix: &str,
        depth: usize,
    ) {
        if depth > MAX_FIELD_DEPTH {
            return;
        }

        for (key, value) in fields {
            let field_path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            let class = classifier::classify_parameter(&self.rules, key);

            let mut node = Node::new(
                instance_id("field"),
                self.labels("BodyField", Some(&class.param_type)),
            )
            .prop("name", key.as_str())
            .prop("type", class.param_type.as_str())
            .prop("path", field_path.as_str())
            .prop("depth", depth)
            .prop("risk", class.risk.as_str());
            // Scalar values only; objects and arrays are structure, not data.
            match value {
                Value::Object(_) | Value::Array(_) => {}
                Value::String(s) => node = node.prop("value", truncate(s)),
                other => node = node.prop("value", truncate(&other.to_string())),
            }
            let field_id = node.id.clone();

            graph.relationships.push(
                Relationship::new(parent_id, &field_id, "HAS_FIELD").prop("depth", depth),
            );
            graph.nodes.push(node);

            if let Value::Object(nested) = value {
                self.map_body_fields(graph, &field_id, nested, &field_path, depth + 1);
            }
        }
    }

    fn map_endpoint(
        &self,
        graph: &mut GraphData,
        request_id: &str,
        request: &HttpRequest,
        url: &Url,
        path: &str,
    ) {
        let pattern = endpoint_pattern(path);
        let class = classifier::classify_endpoint(&self.rules, path);

        let node = Node::new(
            content_id("endpoint", &[&request.method, &pattern]),
            self.labels("Endpoint", Some(&class.endpoint_type)),
        )
        .prop("path", pattern.as_str())
        .prop("method", request.method.as_str())
        .prop("domain", url.host_str().unwrap_or(""))
        .prop("type", class.endpoint_type.as_str())
        .prop("risk", class.risk.as_str())
        .prop("requires_auth", class.requires_auth);

        graph.relationships.push(
            Relationship::new(request_id, &node.id, "TARGETS")
                .prop("timestamp", request.timestamp.as_str()),
        );
        graph.nodes.push(node);
    }

    fn map_user(&self, graph: &mut GraphData, request_id: &str, request: &HttpRequest) {
        let Some(user) = classifier::extract_user(&self.rules, request) else {
            return;
        };

        let node = Node::new(
            content_id("user", &[user.resolved_id()]),
            self.labels("User", None),
        )
        .prop("user_id", user.user_id.as_deref().unwrap_or("unknown"))
        .prop("username", user.username.as_deref().unwrap_or("unknown"))
        .prop("auth_method", user.auth_method)
        .prop("token_preview", user.token_preview.as_deref().unwrap_or(""));

        graph.relationships.push(
            Relationship::new(request_id, &node.id, "AUTHENTICATED_AS")
                .prop("auth_method", user.auth_method)
                .prop("timestamp", request.timestamp.as_str()),
        );
        graph.nodes.push(node);
    }

    fn map_resources(
        &self,
        graph: &mut GraphData,
        request_id: &str,
        request: &HttpRequest,
        path: &str,
        query_pairs: &[(String, String)],
    ) {
        for resource in
            classifier::extract_resources(&self.rules, &request.method, path, query_pairs)
        {
            let type_label = resource.resource_type.to_uppercase();
            let node = Node::new(
                content_id(
                    "resource",
                    &[&resource.resource_type, &resource.resource_id],
                ),
                self.labels("Resource", Some(&type_label)),
            )
            .prop("resource_id", resource.resource_id.as_str())
            .prop("resource_type", resource.resource_type.as_str())
            .prop("operation", resource.operation);

            graph.relationships.push(
                Relationship::new(request_id, &node.id, "ACCESSES")
                    .prop("operation", resource.operation)
                    .prop("access_type", "direct"),
            );
            graph.nodes.push(node);
        }
    }
}

fn truncate(value: &str) -> String {
    if value.chars().count() > MAX_VALUE_LEN {
        value.chars().take(MAX_VALUE_LEN).collect()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse_request;
    use crate::rules::RuleConfig;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    fn mapper() -> GraphMapper {
        GraphMapper::new(Arc::new(RuleSet::compile(RuleConfig::default())))
    }

    fn jwt_for(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn test_end_to_end_scenario() {
        let token = jwt_for(serde_json::json!({"sub": "42", "name": "bob"}));
        let raw = format!(
            "GET /api/users/42?debug=true HTTP/1.1\r\nHost: api.test\r\nAuthorization: Bearer {token}\r\n\r\n"
        );
        let request = parse_request(&raw, "2024-03-01T10:00:00Z").unwrap();
        let graph = mapper().map_request(&request).unwrap();

        let request_node = graph.find_by_label("Request").unwrap();
        assert_eq!(request_node.properties["method"], "GET");

        let endpoint = graph.find_by_label("Endpoint").unwrap();
        assert_eq!(endpoint.properties["type"], "USER_DATA");
        assert_eq!(endpoint.properties["path"], "/api/users/{id}");
        assert_eq!(endpoint.properties["domain"], "api.test");

        let param = graph.find_by_label("Parameter").unwrap();
        assert_eq!(param.properties["name"], "debug");
        assert_eq!(param.properties["type"], "GENERIC");

        let user = graph.find_by_label("User").unwrap();
        assert_eq!(user.properties["user_id"], "42");
        assert_eq!(user.properties["username"], "bob");
        assert_eq!(user.properties["auth_method"], "jwt");

        let resource = graph.find_by_label("Resource").unwrap();
        assert_eq!(resource.properties["resource_id"], "42");
        assert_eq!(resource.properties["resource_type"], "user");

        for rel_type in ["TARGETS", "HAS_PARAMETER", "AUTHENTICATED_AS", "ACCESSES"] {
            assert!(
                graph.relationships.iter().any(|r| r.rel_type == rel_type),
                "missing {rel_type}"
            );
        }
    }

    #[test]
    fn test_repeated_query_keys_kept() {
        let raw = "GET /search?tag=a&tag=b HTTP/1.1\r\nHost: x\r\n\r\n";
        let request = parse_request(raw, "").unwrap();
        let graph = mapper().map_request(&request).unwrap();

        let params: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| n.has_label("Parameter"))
            .collect();
        assert_eq!(params.len(), 2);
        assert_ne!(params[0].id, params[1].id);

        let positions: Vec<_> = graph
            .relationships
            .iter()
            .filter(|r| r.rel_type == "HAS_PARAMETER")
            .map(|r| r.properties["position"].as_u64().unwrap())
            .collect();
        assert_eq!(positions, vec![0, 1]);
    }

    #[test]
    fn test_unmatched_headers_dropped_and_sensitive_redacted() {
        let raw = "GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Bearer secret\r\nX-Obscure-Header: whatever\r\n\r\n";
        let request = parse_request(raw, "").unwrap();
        let graph = mapper().map_request(&request).unwrap();

        let headers: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| n.has_label("Header"))
            .collect();
        assert!(headers
            .iter()
            .all(|h| h.properties["name"] != "X-Obscure-Header"));

        let auth = headers
            .iter()
            .find(|h| h.properties["name"] == "Authorization")
            .unwrap();
        assert_eq!(auth.properties["value"], "[redacted]");
        assert_eq!(auth.properties["is_sensitive"], true);

        let host = headers
            .iter()
            .find(|h| h.properties["name"] == "Host")
            .unwrap();
        assert_eq!(host.properties["value"], "x");
    }

    #[test]
    fn test_body_fields_recursive_with_depth_limit() {
        // 8 levels of nesting; fields exist only at depths 0..=5.
        let body = r#"{"a":{"b":{"c":{"d":{"e":{"f":{"g":{"h":1}}}}}}}}"#;
        let raw = format!(
            "POST /api/things HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\n\r\n{body}"
        );
        let request = parse_request(&raw, "").unwrap();
        let graph = mapper().map_request(&request).unwrap();

        let fields: Vec<_> = graph
            .nodes
            .iter()
            .filter(|n| n.has_label("BodyField"))
            .collect();
        assert_eq!(fields.len(), 6);
        let max_depth = fields
            .iter()
            .map(|f| f.properties["depth"].as_u64().unwrap())
            .max()
            .unwrap();
        assert_eq!(max_depth, 5);
    }

    #[test]
    fn test_body_field_paths_and_values() {
        let body = r#"{"user":{"id":7},"note":"hello"}"#;
        let raw = format!(
            "POST /api/notes HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\n\r\n{body}"
        );
        let request = parse_request(&raw, "").unwrap();
        let graph = mapper().map_request(&request).unwrap();

        let nested = graph
            .nodes
            .iter()
            .find(|n| n.has_label("BodyField") && n.properties["path"] == "user.id")
            .unwrap();
        assert_eq!(nested.properties["value"], "7");
        assert_eq!(nested.properties["type"], "ID_REFERENCE");

        let object_field = graph
            .nodes
            .iter()
            .find(|n| n.has_label("BodyField") && n.properties["path"] == "user")
            .unwrap();
        assert!(!object_field.properties.contains_key("value"));
    }

    #[test]
    fn test_text_body_has_no_fields() {
        let raw = "POST /api HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\n\r\nplain text";
        let request = parse_request(raw, "").unwrap();
        let graph = mapper().map_request(&request).unwrap();

        let body = graph.find_by_label("Body").unwrap();
        assert_eq!(body.properties["encoding"], "text");
        assert!(graph.find_by_label("BodyField").is_none());
    }

    #[test]
    fn test_endpoint_id_merges_across_concrete_paths() {
        let m = mapper();
        let a = parse_request("GET /api/users/42 HTTP/1.1\r\nHost: x\r\n\r\n", "").unwrap();
        let b = parse_request("GET /api/users/43 HTTP/1.1\r\nHost: x\r\n\r\n", "").unwrap();
        let ga = m.map_request(&a).unwrap();
        let gb = m.map_request(&b).unwrap();
        assert_eq!(
            ga.find_by_label("Endpoint").unwrap().id,
            gb.find_by_label("Endpoint").unwrap().id
        );
        // Request instances never merge.
        assert_ne!(
            ga.find_by_label("Request").unwrap().id,
            gb.find_by_label("Request").unwrap().id
        );
    }

    #[test]
    fn test_every_node_reachable() {
        let token = jwt_for(serde_json::json!({"sub": "9"}));
        let raw = format!(
            "POST /api/users/9?debug=1 HTTP/1.1\r\nHost: x\r\nAuthorization: Bearer {token}\r\nContent-Type: application/json\r\n\r\n{{\"name\":\"n\"}}"
        );
        let request = parse_request(&raw, "").unwrap();
        let graph = mapper().map_request(&request).unwrap();

        let request_id = &graph.find_by_label("Request").unwrap().id;
        for node in &graph.nodes {
            if &node.id == request_id {
                continue;
            }
            assert!(
                graph.relationships.iter().any(|r| r.target_id == node.id),
                "unreachable node {}",
                node.id
            );
        }
    }
}
