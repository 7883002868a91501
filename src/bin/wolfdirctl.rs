//! WolfDirCtl - Command line tool for operating WolfDir replicas
//!
//! Usage:
//!   wolfdirctl status              - Show replica status
//!   wolfdirctl promote             - Make the replica leader
//!   wolfdirctl demote              - Make the replica a follower
//!   wolfdirctl request '<json>'    - Send one directory request
//!   wolfdirctl check-config        - Check a configuration file

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

/// WolfDir Replica Control Tool
#[derive(Parser)]
#[command(name = "wolfdirctl")]
#[command(about = "Control and monitor WolfDir replicas", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfdir/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status of the replica
    Status,
    /// Make the replica leader
    Promote,
    /// Make the replica a follower
    Demote,
    /// Send a JSON directory request, e.g. '{"kind":"get_subject","uin":42}'
    Request {
        json: String,
        /// Resend this many times while the replica asks for a retry
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    node_id: String,
    role: String,
    #[serde(default)]
    role_transitions: u64,
    #[serde(default)]
    uptime_seconds: u64,
    #[serde(default)]
    workers: usize,
    #[serde(default)]
    retries: u64,
    store: StoreStats,
    #[serde(default)]
    subject_cache: Option<CacheStats>,
    #[serde(default)]
    sessions: usize,
    #[serde(default)]
    logins: usize,
}

#[derive(Debug, Deserialize)]
struct StoreStats {
    #[serde(default)]
    connects: u64,
    #[serde(default)]
    statements: u64,
    #[serde(default)]
    transactions: u64,
}

#[derive(Debug, Deserialize)]
struct CacheStats {
    #[serde(default)]
    elements: usize,
    #[serde(default)]
    bytes: usize,
    #[serde(default)]
    hits: u64,
    #[serde(default)]
    misses: u64,
}

#[derive(Debug, Deserialize)]
struct RoleResponse {
    success: bool,
    role: String,
}

/// Minimal config for reading the API address
#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiSection,
}

#[derive(Debug, Deserialize)]
struct ApiSection {
    #[serde(default = "default_bind_address")]
    bind_address: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8090".to_string()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Promote => change_role(&endpoint, "promote").await,
        Commands::Demote => change_role(&endpoint, "demote").await,
        Commands::Request { json, retries } => send_request(&endpoint, json, *retries).await,
        Commands::CheckConfig { file } => check_config(file.as_ref().unwrap_or(&cli.config)),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// API endpoint from the config file, with 0.0.0.0 mapped to localhost
fn endpoint_from_config(path: &std::path::Path) -> String {
    let address = std::fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.api.bind_address)
        .unwrap_or_else(default_bind_address);

    match address.strip_prefix("0.0.0.0") {
        Some(port) => format!("http://127.0.0.1{}", port),
        None => format!("http://{}", address),
    }
}

async fn show_status(endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/status", endpoint);
    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    let status: StatusResponse = response.json().await?;

    println!();
    println!("Replica Status");
    println!("==============");
    println!();
    println!("Node ID:      {}", status.node_id);
    println!("Role:         {} ({} transitions)", status.role, status.role_transitions);
    println!("Uptime:       {} s", status.uptime_seconds);
    println!("Workers:      {}", status.workers);
    println!("Retries:      {}", status.retries);
    println!(
        "Store:        {} statements, {} transactions, {} connects",
        status.store.statements, status.store.transactions, status.store.connects
    );
    match status.subject_cache {
        Some(cache) => println!(
            "Subjects:     {} cached ({} bytes), {} hits, {} misses",
            cache.elements, cache.bytes, cache.hits, cache.misses
        ),
        None => println!("Subjects:     cache disabled"),
    }
    println!("Sessions:     {} cached, {} logins", status.sessions, status.logins);
    println!();

    Ok(())
}

async fn change_role(endpoint: &str, action: &str) -> anyhow::Result<()> {
    let url = format!("{}/admin/{}", endpoint, action);
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("cannot reach {}", url))?;

    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }

    let result: RoleResponse = response.json().await?;
    if !result.success {
        bail!("{} refused", action);
    }
    println!("Replica is now {}", result.role);
    Ok(())
}

async fn send_request(endpoint: &str, json: &str, retries: u32) -> anyhow::Result<()> {
    let body: serde_json::Value = serde_json::from_str(json).context("request is not valid JSON")?;
    let url = format!("{}/request", endpoint);
    let client = reqwest::Client::new();

    for attempt in 0..=retries {
        let response = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("cannot reach {}", url))?;

        let status = response.status();
        let reply: serde_json::Value = response.json().await?;

        if reply["outcome"] == "retry" {
            if attempt < retries {
                eprintln!("Replica asked for a retry, resending ({}/{})", attempt + 1, retries);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            bail!("replica is not leader, send the request to the leader");
        }

        println!("{}", serde_json::to_string_pretty(&reply)?);
        if !status.is_success() {
            bail!("API error: {}", status);
        }
        return Ok(());
    }

    Ok(())
}

fn check_config(path: &std::path::Path) -> anyhow::Result<()> {
    let config = wolfdir::config::WolfDirConfig::from_file(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    println!("✓ Configuration is valid");
    println!("  Node ID: {}", config.node.id);
    println!("  API:     {}", config.api.bind_address);
    Ok(())
}
