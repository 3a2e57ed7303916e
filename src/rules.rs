use crate::error::IngestError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Type name used as the classification fallback. A parameter pattern
/// entry with this type is skipped during matching and applied when
/// nothing else matches.
pub const GENERIC_TYPE: &str = "GENERIC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
        }
    }
}

/// The declarative rule document, loaded from YAML at startup.
///
/// Pattern sections are ordered lists: classification is
/// first-match-wins in declaration order, so order is part of the
/// contract and the document must preserve it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub node_templates: HashMap<String, NodeTemplate>,
    pub parameter_patterns: Vec<ParameterPattern>,
    pub header_patterns: Vec<HeaderCategory>,
    pub endpoint_patterns: Vec<EndpointPattern>,
    pub user_extraction: Option<UserExtraction>,
    pub resource_extraction: Option<ResourceExtraction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTemplate {
    #[serde(default)]
    pub additional_labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterPattern {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub risk: Risk,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderCategory {
    pub category: String,
    pub headers: Vec<String>,
    pub is_sensitive: bool,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointPattern {
    pub pattern: String,
    #[serde(rename = "type")]
    pub endpoint_type: String,
    #[serde(default)]
    pub risk: Risk,
    #[serde(default)]
    pub requires_auth: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserExtraction {
    pub jwt: Option<JwtRule>,
    pub cookie: Option<CookieRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtRule {
    pub enabled: bool,
    #[serde(default = "default_bearer_prefix")]
    pub header_prefix: String,
    pub user_id_claims: Vec<String>,
    pub username_claims: Vec<String>,
}

fn default_bearer_prefix() -> String {
    "Bearer ".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieRule {
    pub enabled: bool,
    #[serde(default)]
    pub user_id_patterns: Vec<String>,
    #[serde(default)]
    pub username_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceExtraction {
    #[serde(default)]
    pub url_patterns: Vec<ResourceUrlPattern>,
    #[serde(default)]
    pub parameter_patterns: Vec<ResourceParameterPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUrlPattern {
    pub pattern: String,
    pub resource_type: String,
    #[serde(default = "default_id_group")]
    pub id_group: usize,
}

fn default_id_group() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceParameterPattern {
    pub resource_type: String,
    pub parameters: Vec<String>,
}

impl RuleConfig {
    pub fn from_file(path: &Path) -> Result<Self, IngestError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| IngestError::RuleLoad(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| IngestError::RuleLoad(format!("{}: {e}", path.display())))
    }

    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl Default for RuleConfig {
    fn default() -> Self {
        RuleConfig {
            node_templates: HashMap::new(),
            parameter_patterns: vec![
                ParameterPattern {
                    param_type: "ID_REFERENCE".to_string(),
                    patterns: vec![
                        r"^id$".to_string(),
                        r"_id$".to_string(),
                        r"^user_?id$".to_string(),
                        r"^account".to_string(),
                        r"^uid$".to_string(),
                    ],
                    risk: Risk::High,
                    description: "Direct object reference".to_string(),
                },
                ParameterPattern {
                    param_type: "AUTH_TOKEN".to_string(),
                    patterns: vec![
                        r"token".to_string(),
                        r"session".to_string(),
                        r"^auth".to_string(),
                        r"api_?key".to_string(),
                    ],
                    risk: Risk::High,
                    description: "Authentication material".to_string(),
                },
                ParameterPattern {
                    param_type: "FILE_PATH".to_string(),
                    patterns: vec![
                        r"file".to_string(),
                        r"path".to_string(),
                        r"^doc".to_string(),
                    ],
                    risk: Risk::Medium,
                    description: "File or document reference".to_string(),
                },
                ParameterPattern {
                    param_type: "EMAIL".to_string(),
                    patterns: vec![r"e-?mail".to_string()],
                    risk: Risk::Medium,
                    description: "Email address".to_string(),
                },
                ParameterPattern {
                    param_type: GENERIC_TYPE.to_string(),
                    patterns: vec![],
                    risk: Risk::Low,
                    description: "Unclassified parameter".to_string(),
                },
            ],
            header_patterns: vec![
                HeaderCategory {
                    category: "AUTHENTICATION".to_string(),
                    headers: vec![
                        "Authorization".to_string(),
                        "Cookie".to_string(),
                        "X-Api-Key".to_string(),
                        "X-Auth-Token".to_string(),
                    ],
                    is_sensitive: true,
                    description: "Credentials and session material".to_string(),
                },
                HeaderCategory {
                    category: "IDENTITY".to_string(),
                    headers: vec!["X-User-Id".to_string(), "X-Username".to_string()],
                    is_sensitive: false,
                    description: "Caller identity hints".to_string(),
                },
                HeaderCategory {
                    category: "CONTENT".to_string(),
                    headers: vec![
                        "Content-Type".to_string(),
                        "Content-Length".to_string(),
                        "Accept".to_string(),
                    ],
                    is_sensitive: false,
                    description: "Payload negotiation".to_string(),
                },
                HeaderCategory {
                    category: "CLIENT".to_string(),
                    headers: vec![
                        "Host".to_string(),
                        "User-Agent".to_string(),
                        "Referer".to_string(),
                        "Origin".to_string(),
                    ],
                    is_sensitive: false,
                    description: "Client and origin context".to_string(),
                },
            ],
            endpoint_patterns: vec![
                EndpointPattern {
                    pattern: r"^/(api/)?(auth|login|logout|register|token)".to_string(),
                    endpoint_type: "AUTH".to_string(),
                    risk: Risk::High,
                    requires_auth: false,
                },
                EndpointPattern {
                    pattern: r"^/(api/)?admin".to_string(),
                    endpoint_type: "ADMIN".to_string(),
                    risk: Risk::High,
                    requires_auth: true,
                },
                EndpointPattern {
                    pattern: r"^/(api/)?users?(/|$)".to_string(),
                    endpoint_type: "USER_DATA".to_string(),
                    risk: Risk::High,
                    requires_auth: true,
                },
                EndpointPattern {
                    pattern: r"^/api/".to_string(),
                    endpoint_type: "API".to_string(),
                    risk: Risk::Medium,
                    requires_auth: false,
                },
            ],
            user_extraction: Some(UserExtraction {
                jwt: Some(JwtRule {
                    enabled: true,
                    header_prefix: "Bearer ".to_string(),
                    user_id_claims: vec![
                        "sub".to_string(),
                        "user_id".to_string(),
                        "uid".to_string(),
                        "id".to_string(),
                    ],
                    username_claims: vec![
                        "name".to_string(),
                        "username".to_string(),
                        "preferred_username".to_string(),
                        "email".to_string(),
                    ],
                }),
                cookie: Some(CookieRule {
                    enabled: true,
                    user_id_patterns: vec![r"(?:^|;\s*)user_?id=([^;\s]+)".to_string()],
                    username_patterns: vec![r"(?:^|;\s*)username=([^;\s]+)".to_string()],
                }),
            }),
            resource_extraction: Some(ResourceExtraction {
                url_patterns: vec![
                    ResourceUrlPattern {
                        pattern: r"^/(?:api/)?users?/([^/?]+)".to_string(),
                        resource_type: "user".to_string(),
                        id_group: 1,
                    },
                    ResourceUrlPattern {
                        pattern: r"^/(?:api/)?orders?/([^/?]+)".to_string(),
                        resource_type: "order".to_string(),
                        id_group: 1,
                    },
                    ResourceUrlPattern {
                        pattern: r"^/(?:api/)?(?:docs|documents|files)/([^/?]+)".to_string(),
                        resource_type: "document".to_string(),
                        id_group: 1,
                    },
                ],
                parameter_patterns: vec![
                    ResourceParameterPattern {
                        resource_type: "user".to_string(),
                        parameters: vec!["user_id".to_string(), "uid".to_string()],
                    },
                    ResourceParameterPattern {
                        resource_type: "document".to_string(),
                        parameters: vec!["doc_id".to_string(), "file_id".to_string()],
                    },
                ],
            }),
        }
    }
}

#[derive(Debug)]
pub struct CompiledParameterRule {
    pub param_type: String,
    pub risk: Risk,
    pub description: String,
    pub patterns: Vec<Regex>,
}

#[derive(Debug)]
pub struct CompiledEndpointRule {
    pub regex: Regex,
    pub endpoint_type: String,
    pub risk: Risk,
    pub requires_auth: bool,
}

#[derive(Debug)]
pub struct CompiledResourceRule {
    pub regex: Regex,
    pub resource_type: String,
    pub id_group: usize,
}

/// The loaded rule set with every regex compiled once. Immutable after
/// construction; `reload` builds a fresh set from the same path.
#[derive(Debug)]
pub struct RuleSet {
    config: RuleConfig,
    path: Option<PathBuf>,
    pub parameter_rules: Vec<CompiledParameterRule>,
    pub endpoint_rules: Vec<CompiledEndpointRule>,
    pub cookie_id_patterns: Vec<Regex>,
    pub cookie_username_patterns: Vec<Regex>,
    pub resource_url_rules: Vec<CompiledResourceRule>,
}

impl RuleSet {
    pub fn load(path: &Path) -> Result<Self, IngestError> {
        let config = RuleConfig::from_file(path)?;
        let mut set = Self::compile(config);
        set.path = Some(path.to_path_buf());
        log::info!("Loaded parsing rules from {}", path.display());
        Ok(set)
    }

    /// Re-read and re-compile the rule document this set was loaded
    /// from. Sets built directly from a config have no path to reload.
    pub fn reload(&self) -> Result<Self, IngestError> {
        match &self.path {
            Some(path) => Self::load(path),
            None => Err(IngestError::RuleLoad(
                "rule set was not loaded from a file".to_string(),
            )),
        }
    }

    /// Compile a rule config. A single malformed regex is logged and
    /// skipped; it never fails the whole set.
    pub fn compile(config: RuleConfig) -> Self {
        let parameter_rules = config
            .parameter_patterns
            .iter()
            .map(|p| CompiledParameterRule {
                param_type: p.param_type.clone(),
                risk: p.risk,
                description: p.description.clone(),
                patterns: p
                    .patterns
                    .iter()
                    .filter_map(|pat| compile_pattern(pat, true))
                    .collect(),
            })
            .collect();

        let endpoint_rules = config
            .endpoint_patterns
            .iter()
            .filter_map(|p| {
                Some(CompiledEndpointRule {
                    regex: compile_pattern(&p.pattern, false)?,
                    endpoint_type: p.endpoint_type.clone(),
                    risk: p.risk,
                    requires_auth: p.requires_auth,
                })
            })
            .collect();

        let cookie = config
            .user_extraction
            .as_ref()
            .and_then(|u| u.cookie.as_ref());
        let cookie_id_patterns = cookie
            .map(|c| {
                c.user_id_patterns
                    .iter()
                    .filter_map(|p| compile_pattern(p, false))
                    .collect()
            })
            .unwrap_or_default();
        let cookie_username_patterns = cookie
            .map(|c| {
                c.username_patterns
                    .iter()
                    .filter_map(|p| compile_pattern(p, false))
                    .collect()
            })
            .unwrap_or_default();

        let resource_url_rules = config
            .resource_extraction
            .as_ref()
            .map(|r| {
                r.url_patterns
                    .iter()
                    .filter_map(|p| {
                        Some(CompiledResourceRule {
                            regex: compile_pattern(&p.pattern, false)?,
                            resource_type: p.resource_type.clone(),
                            id_group: p.id_group,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        RuleSet {
            config,
            path: None,
            parameter_rules,
            endpoint_rules,
            cookie_id_patterns,
            cookie_username_patterns,
            resource_url_rules,
        }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    pub fn jwt_rule(&self) -> Option<&JwtRule> {
        self.config
            .user_extraction
            .as_ref()
            .and_then(|u| u.jwt.as_ref())
            .filter(|j| j.enabled)
    }

    pub fn cookie_rule_enabled(&self) -> bool {
        self.config
            .user_extraction
            .as_ref()
            .and_then(|u| u.cookie.as_ref())
            .map(|c| c.enabled)
            .unwrap_or(false)
    }

    pub fn header_category(&self, header_name: &str) -> Option<&HeaderCategory> {
        self.config
            .header_patterns
            .iter()
            .find(|cat| cat.headers.iter().any(|h| h == header_name))
    }

    pub fn resource_parameter_patterns(&self) -> &[ResourceParameterPattern] {
        self.config
            .resource_extraction
            .as_ref()
            .map(|r| r.parameter_patterns.as_slice())
            .unwrap_or(&[])
    }

    pub fn additional_labels(&self, entity: &str) -> &[String] {
        self.config
            .node_templates
            .get(entity)
            .map(|t| t.additional_labels.as_slice())
            .unwrap_or(&[])
    }
}

fn compile_pattern(pattern: &str, case_insensitive: bool) -> Option<Regex> {
    match RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
    {
        Ok(re) => Some(re),
        Err(e) => {
            log::warn!("Invalid regex pattern {pattern:?}: {e}");
            None
        }
    }
}
