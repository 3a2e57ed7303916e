use clap::{Arg, Command};
use idor_graph::loader::GraphLoader;
use idor_graph::neo4j::Neo4jStore;
use idor_graph::rules::{RuleConfig, RuleSet};
use idor_graph::settings::Settings;
use idor_graph::store::{GraphStore, MemoryStore};
use idor_graph::{http, server};
use log::LevelFilter;
use serde::Deserialize;
use std::path::Path;
use std::process;
use std::sync::Arc;

/// One entry of a JSON capture file produced by the proxy extension.
#[derive(Debug, Deserialize)]
struct CaptureEntry {
    request: String,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[tokio::main]
async fn main() {
    let matches = Command::new("idor-graph")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Builds an API-access property graph from intercepted HTTP traffic for IDOR analysis")
        .arg(
            Arg::new("rules")
                .short('r')
                .long("rules")
                .value_name("FILE")
                .help("Parsing rules file path (default: RULES_PATH env or config/parsing_rules.yaml)"),
        )
        .arg(
            Arg::new("generate-rules")
                .long("generate-rules")
                .value_name("FILE")
                .help("Write the built-in default rule set to a file and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-rules")
                .long("test-rules")
                .help("Load and compile the rules file, report validity, and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("load")
                .long("load")
                .value_name("FILE")
                .help("Load a JSON capture file instead of serving")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("present")
                .long("present")
                .help("Print graph statistics and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("demo")
                .long("demo")
                .help("Use an in-memory graph store instead of Neo4j")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(path) = matches.get_one::<String>("generate-rules") {
        match RuleConfig::default().to_file(Path::new(path)) {
            Ok(()) => {
                println!("Default rules written to {path}");
                return;
            }
            Err(e) => {
                eprintln!("Failed to write rules: {e}");
                process::exit(1);
            }
        }
    }

    let settings = Settings::from_env();
    let rules_path = matches
        .get_one::<String>("rules")
        .cloned()
        .unwrap_or_else(|| settings.rules_path.clone());

    if matches.get_flag("test-rules") {
        match RuleSet::load(Path::new(&rules_path)) {
            Ok(rules) => {
                println!(
                    "Rules OK: {} parameter types, {} header categories, {} endpoint patterns",
                    rules.parameter_rules.len(),
                    rules.config().header_patterns.len(),
                    rules.endpoint_rules.len()
                );
                return;
            }
            Err(e) => {
                eprintln!("Rules invalid: {e}");
                process::exit(1);
            }
        }
    }

    // Malformed or unreadable rules are fatal at startup.
    let rules = match RuleSet::load(Path::new(&rules_path)) {
        Ok(rules) => Arc::new(rules),
        Err(e) => {
            eprintln!("Failed to load rules from {rules_path}: {e}");
            process::exit(1);
        }
    };

    let store: Arc<dyn GraphStore> = if matches.get_flag("demo") {
        log::info!("Using in-memory graph store");
        Arc::new(MemoryStore::new())
    } else {
        log::info!("Using Neo4j at {}", settings.neo4j_uri);
        Arc::new(Neo4jStore::new(&settings))
    };
    let loader = Arc::new(GraphLoader::new(rules, store));

    if let Some(file) = matches.get_one::<String>("load") {
        if let Err(e) = load_capture_file(&loader, file).await {
            eprintln!("Load failed: {e}");
            process::exit(1);
        }
        return;
    }

    if matches.get_flag("present") {
        match loader.statistics().await {
            Ok(stats) => {
                match serde_json::to_string_pretty(&stats) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("Failed to render statistics: {e}");
                        process::exit(1);
                    }
                }
                return;
            }
            Err(e) => {
                eprintln!("Failed to read statistics: {e}");
                process::exit(1);
            }
        }
    }

    if let Err(e) = server::run(&settings, loader).await {
        eprintln!("Server error: {e}");
        process::exit(1);
    }
}

async fn load_capture_file(loader: &GraphLoader, path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let entries: Vec<CaptureEntry> = serde_json::from_str(&content)?;
    log::info!("Read {} capture entries from {path}", entries.len());

    let mut requests = Vec::new();
    let mut parse_errors = 0usize;
    for (idx, entry) in entries.iter().enumerate() {
        if let Some(raw_response) = &entry.response {
            if let Err(e) = http::parse_response(raw_response) {
                log::warn!("Entry {}: unparsable response: {e}", idx + 1);
            }
        }
        let timestamp = entry.timestamp.as_deref().unwrap_or("");
        match http::parse_request(&entry.request, timestamp) {
            Ok(request) => requests.push(request),
            Err(e) => {
                log::error!("Entry {}: {e}", idx + 1);
                parse_errors += 1;
            }
        }
    }

    let stats = loader.load_requests(&requests).await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    if parse_errors > 0 {
        println!("{parse_errors} entries failed to parse");
    }
    Ok(())
}
