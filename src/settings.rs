use std::env;

/// Process configuration, resolved from environment variables with
/// defaults suitable for a local Neo4j and a local listener.
#[derive(Debug, Clone)]
pub struct Settings {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub neo4j_database: String,
    pub server_host: String,
    pub server_port: u16,
    pub rules_path: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Settings {
            neo4j_uri: env_or("NEO4J_URI", "http://localhost:7474"),
            neo4j_user: env_or("NEO4J_USER", "neo4j"),
            neo4j_password: env_or("NEO4J_PASSWORD", "neo4j"),
            neo4j_database: env_or("NEO4J_DATABASE", "neo4j"),
            server_host: env_or("SERVER_HOST", "0.0.0.0"),
            server_port: env_or("SERVER_PORT", "5000").parse().unwrap_or(5000),
            rules_path: env_or("RULES_PATH", "config/parsing_rules.yaml"),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
