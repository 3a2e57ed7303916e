use crate::http::HttpRequest;
use crate::rules::{HeaderCategory, Risk, RuleSet, GENERIC_TYPE};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Classification result for a parameter name (query parameter or JSON
/// body field; both follow the same rules).
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterClass {
    pub param_type: String,
    pub risk: Risk,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointClass {
    pub endpoint_type: String,
    pub risk: Risk,
    pub requires_auth: bool,
}

/// Identity inferred from auth material in the request. Untrusted
/// metadata: JWT payloads are decoded without signature verification.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentity {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub auth_method: &'static str,
    pub token_preview: Option<String>,
}

impl UserIdentity {
    /// The identifier the User node is keyed on: the user id when one
    /// was found, otherwise the username.
    pub fn resolved_id(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.username.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
    pub operation: &'static str,
}

/// Classify a parameter name: each configured type is tried in
/// declaration order (the fallback type is skipped), first regex match
/// wins; no match falls back to the generic type.
pub fn classify_parameter(rules: &RuleSet, name: &str) -> ParameterClass {
    for rule in &rules.parameter_rules {
        if rule.param_type == GENERIC_TYPE {
            continue;
        }
        if rule.patterns.iter().any(|re| re.is_match(name)) {
            return ParameterClass {
                param_type: rule.param_type.clone(),
                risk: rule.risk,
                description: rule.description.clone(),
            };
        }
    }

    rules
        .parameter_rules
        .iter()
        .find(|r| r.param_type == GENERIC_TYPE)
        .map(|r| ParameterClass {
            param_type: r.param_type.clone(),
            risk: r.risk,
            description: r.description.clone(),
        })
        .unwrap_or(ParameterClass {
            param_type: GENERIC_TYPE.to_string(),
            risk: Risk::Low,
            description: "Unclassified parameter".to_string(),
        })
}

/// Classify a header by exact case-sensitive name lookup; the first
/// category listing the name wins. Unmatched headers are dropped by
/// the mapper, so this returns `None` rather than a catch-all.
pub fn classify_header<'a>(rules: &'a RuleSet, name: &str) -> Option<&'a HeaderCategory> {
    rules.header_category(name)
}

/// Classify a URL path: first endpoint pattern whose regex matches at
/// the start of the path wins; no match is generic, low risk, no auth.
pub fn classify_endpoint(rules: &RuleSet, path: &str) -> EndpointClass {
    for rule in &rules.endpoint_rules {
        if rule.regex.find(path).is_some_and(|m| m.start() == 0) {
            return EndpointClass {
                endpoint_type: rule.endpoint_type.clone(),
                risk: rule.risk,
                requires_auth: rule.requires_auth,
            };
        }
    }
    EndpointClass {
        endpoint_type: GENERIC_TYPE.to_string(),
        risk: Risk::Low,
        requires_auth: false,
    }
}

/// Decode a JWT payload segment as base64url JSON. No verification:
/// the claims feed graph metadata, never an auth decision.
pub fn decode_jwt_payload(token: &str) -> Option<serde_json::Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let payload = parts[1].trim_end_matches('=');
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&decoded).ok()
}

fn claim_as_string(payload: &serde_json::Value, claim: &str) -> Option<String> {
    match payload.get(claim)? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Derive the authenticated identity, JWT first, cookie patterns as
/// the fallback when no JWT-derived id was found. Returns `None`
/// unless at least an id or a username was extracted.
pub fn extract_user(rules: &RuleSet, request: &HttpRequest) -> Option<UserIdentity> {
    let mut user_id: Option<String> = None;
    let mut username: Option<String> = None;
    let mut auth_method = "";
    let mut token_preview: Option<String> = None;

    if let Some(jwt) = rules.jwt_rule() {
        let auth_header = request.header("Authorization").unwrap_or("");
        if let Some(token) = auth_header.strip_prefix(jwt.header_prefix.as_str()) {
            // Truncation counts characters; byte indexing could split
            // a multibyte token mid-character.
            token_preview = Some(if token.chars().count() > 20 {
                let head: String = token.chars().take(20).collect();
                format!("{head}...")
            } else {
                token.to_string()
            });

            if let Some(payload) = decode_jwt_payload(token) {
                user_id = jwt
                    .user_id_claims
                    .iter()
                    .find_map(|c| claim_as_string(&payload, c));
                username = jwt
                    .username_claims
                    .iter()
                    .find_map(|c| claim_as_string(&payload, c));
                if user_id.is_some() || username.is_some() {
                    auth_method = "jwt";
                }
            }
        }
    }

    if user_id.is_none() && rules.cookie_rule_enabled() {
        let cookie_header = request.header("Cookie").unwrap_or("");
        for re in &rules.cookie_id_patterns {
            if let Some(caps) = re.captures(cookie_header) {
                if let Some(m) = caps.get(1) {
                    user_id = Some(m.as_str().to_string());
                    auth_method = "cookie";
                    break;
                }
            }
        }
        if username.is_none() {
            for re in &rules.cookie_username_patterns {
                if let Some(caps) = re.captures(cookie_header) {
                    if let Some(m) = caps.get(1) {
                        username = Some(m.as_str().to_string());
                        if auth_method.is_empty() {
                            auth_method = "cookie";
                        }
                        break;
                    }
                }
            }
        }
    }

    if user_id.is_none() && username.is_none() {
        return None;
    }

    Some(UserIdentity {
        user_id,
        username,
        auth_method: match auth_method {
            "jwt" => "jwt",
            "cookie" => "cookie",
            _ => "unknown",
        },
        token_preview,
    })
}

pub fn operation_for_method(method: &str) -> &'static str {
    match method.to_ascii_uppercase().as_str() {
        "GET" => "read",
        "POST" => "create",
        "PUT" | "PATCH" => "update",
        "DELETE" => "delete",
        _ => "access",
    }
}

/// Infer accessed resources from the URL path (first matching pattern
/// wins, operation derived from the method) and from query parameters
/// mapped to resource types. One entry per (type, id) pair; the URL
/// match takes precedence over a parameter naming the same pair.
pub fn extract_resources(
    rules: &RuleSet,
    method: &str,
    path: &str,
    query_pairs: &[(String, String)],
) -> Vec<ResourceRef> {
    let mut found: Vec<ResourceRef> = Vec::new();

    for rule in &rules.resource_url_rules {
        if let Some(caps) = rule.regex.captures(path) {
            if caps.get(0).is_some_and(|m| m.start() != 0) {
                continue;
            }
            if let Some(id) = caps.get(rule.id_group) {
                found.push(ResourceRef {
                    resource_type: rule.resource_type.clone(),
                    resource_id: id.as_str().to_string(),
                    operation: operation_for_method(method),
                });
                break;
            }
        }
    }

    for pattern in rules.resource_parameter_patterns() {
        for param_name in &pattern.parameters {
            if let Some((_, value)) = query_pairs.iter().find(|(k, _)| k == param_name) {
                let already = found.iter().any(|r| {
                    r.resource_type == pattern.resource_type && r.resource_id == *value
                });
                if !already {
                    found.push(ResourceRef {
                        resource_type: pattern.resource_type.clone(),
                        resource_id: value.clone(),
                        operation: "access",
                    });
                }
            }
        }
    }

    found
}
