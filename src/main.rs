//! WolfDir - Replicated Directory Service
//!
//! Serves subject, credential and session requests from a shared backing
//! store, with writes gated to the leader replica.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfdir::api::HttpServer;
use wolfdir::cache::SessionCacheServer;
use wolfdir::clock::SystemClock;
use wolfdir::config::{DriverKind, WolfDirConfig};
use wolfdir::directory::{ensure_schema, import_subjects, Directory};
use wolfdir::error::{Error, Result};
use wolfdir::gate::RequestGate;
use wolfdir::server::WorkerPool;
use wolfdir::state::RoleTracker;
use wolfdir::store::{connect_with_retry, MariaDbDriver, SqliteDriver, StoreDriver, WriteGate};
use wolfdir::tuning;

/// WolfDir - Replicated Directory Service
#[derive(Parser)]
#[command(name = "wolfdir")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfdir.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a directory replica
    Start {
        /// Start as leader (single-node setups and initial bootstrap)
        #[arg(long)]
        bootstrap: bool,
    },

    /// Run the shared session cache server
    CacheServer,

    /// Import subjects from a tab-separated file
    Import {
        /// File with one subject per line
        #[arg(short, long)]
        file: PathBuf,

        /// Add nothing unless every line parses
        #[arg(long)]
        all_ok: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfdir.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "dir-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start { bootstrap } => run_start(cli.config, bootstrap).await,
        Commands::CacheServer => run_cache_server(cli.config).await,
        Commands::Import { file, all_ok } => run_import(cli.config, file, all_ok).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(config_path: &std::path::Path) -> Result<WolfDirConfig> {
    match WolfDirConfig::from_file(config_path) {
        Ok(config) => Ok(config),
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            Err(e)
        }
    }
}

/// Start a directory replica
async fn run_start(config_path: PathBuf, bootstrap: bool) -> Result<()> {
    tracing::info!("Starting WolfDir replica...");

    let config = load_config(&config_path)?;
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let role = Arc::new(RoleTracker::new());
    if bootstrap || config.node.bootstrap_leader {
        tracing::info!("Bootstrap mode: starting as leader");
        role.become_leader();
    }

    let directory = Arc::new(Directory::new(
        &config,
        Arc::clone(&role),
        Arc::new(SystemClock),
    )?);
    let gate = Arc::new(RequestGate::new(role, directory));

    match config.database.driver {
        DriverKind::Mariadb => {
            let database = config.database.clone();
            serve(&config, gate, move || MariaDbDriver::new(&database)).await
        }
        DriverKind::Sqlite => {
            let path = config.database.path.clone();
            serve(&config, gate, move || SqliteDriver::new(path.as_str())).await
        }
    }
}

/// Run the worker pool and HTTP API until shutdown or a fatal store error
async fn serve<D, F>(config: &WolfDirConfig, gate: Arc<RequestGate>, mut new_driver: F) -> Result<()>
where
    D: StoreDriver + 'static,
    F: FnMut() -> D,
{
    if gate.role().is_leader() && config.database.update_schema {
        let mut conn = WriteGate::for_role(new_driver(), Arc::clone(gate.role()));
        connect_with_retry(&mut conn, &config.reconnect).await?;
        ensure_schema(&mut conn).await?;
    }

    let workers = tuning::worker_count(config.workers.count);
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
    let pool = Arc::new(WorkerPool::start(
        Arc::clone(&gate),
        new_driver,
        workers,
        workers * 64,
        config.reconnect.clone(),
        fatal_tx,
    ));

    let http = HttpServer::new(
        config.api.clone(),
        config.node.id.clone(),
        gate,
        Arc::clone(&pool),
    );

    tokio::select! {
        result = http.start() => {
            if let Err(e) = &result {
                tracing::error!("HTTP API failed: {}", e);
            }
            pool.shutdown().await;
            result
        }
        Some(e) = fatal_rx.recv() => {
            tracing::error!("Backing store unavailable, exiting: {}", e);
            std::process::exit(1);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
            pool.shutdown().await;
            Ok(())
        }
    }
}

/// Run the shared session cache server
async fn run_cache_server(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let server = SessionCacheServer::new(config.cache_server.bind_address.clone(), &config.session);

    tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            server.stop();
            tracing::info!("Shared session cache stopped");
            Ok(())
        }
    }
}

/// Import subjects as leader
async fn run_import(config_path: PathBuf, file: PathBuf, all_ok: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    let content = std::fs::read_to_string(&file)?;

    let role = Arc::new(RoleTracker::new());
    role.become_leader();
    let directory = Directory::new(&config, Arc::clone(&role), Arc::new(SystemClock))?;

    let report = match config.database.driver {
        DriverKind::Mariadb => {
            let mut conn = WriteGate::for_role(MariaDbDriver::new(&config.database), role);
            prepare_import(&config, &mut conn).await?;
            import_subjects(&directory, &mut conn, &content, all_ok).await?
        }
        DriverKind::Sqlite => {
            let mut conn = WriteGate::for_role(SqliteDriver::new(config.database.path.as_str()), role);
            prepare_import(&config, &mut conn).await?;
            import_subjects(&directory, &mut conn, &content, all_ok).await?
        }
    };

    println!("Added {} subjects from {}", report.added, file.display());
    for refused in &report.refused {
        println!("  line {}: refused, {}", refused.line, refused.reason);
    }
    for malformed in &report.malformed {
        println!("  line {}: malformed, {}", malformed.line, malformed.reason);
    }

    if all_ok && !report.malformed.is_empty() {
        return Err(Error::Config(format!(
            "{} malformed lines, nothing imported",
            report.malformed.len()
        )));
    }
    Ok(())
}

async fn prepare_import<D: StoreDriver>(config: &WolfDirConfig, conn: &mut WriteGate<D>) -> Result<()> {
    connect_with_retry(conn, &config.reconnect).await?;
    if config.database.update_schema {
        ensure_schema(conn).await?;
    }
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfDir Configuration
# Generated configuration file

[node]
id = "{node_id}"
bootstrap_leader = false

[database]
driver = "mariadb"
host = "localhost"
port = 3306
user = "wolfdir"
password = "changeme"
database = "directory"
connect_timeout_secs = 30
update_schema = true
# driver = "sqlite"
# path = "/var/lib/wolfdir/{node_id}.db"

[reconnect]
attempts = 10
delay_ms = 1000

[cache]
enabled = true
max_bytes = 16777216
max_elements = 10000
freshness_secs = 1800

[session]
validity_secs = 604800
refresh_secs = 300
history_secs = 2592000
max_sessions = 50000
max_logins = 50000
backend = "local"
# backend = "shared"
# shared_address = "cache-1.example.com:8091"
request_timeout_ms = 500

[workers]
count = 0

[api]
bind_address = "0.0.0.0:8090"

[cache_server]
bind_address = "0.0.0.0:8091"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Edit the database section, then start with: wolfdir start");

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfDirConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            match config.database.driver {
                DriverKind::Mariadb => println!(
                    "  Database: {}@{}:{}/{}",
                    config.database.user,
                    config.database.host,
                    config.database.port,
                    config.database.database.as_deref().unwrap_or("(default)")
                ),
                DriverKind::Sqlite => println!("  Database: sqlite {}", config.database.path),
            }
            println!("  Session backend: {:?}", config.session.backend);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfDirConfig::from_file(&config_path)?;
    let tuned = tuning::auto_tune();

    println!("WolfDir Node Information");
    println!("========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bootstrap Leader: {}", config.node.bootstrap_leader);
    println!("API Address:      {}", config.api.bind_address);
    println!();
    println!("Database Configuration:");
    println!("  Driver:         {:?}", config.database.driver);
    println!("  Host:           {}:{}", config.database.host, config.database.port);
    println!("  Reconnect:      {} attempts, {} ms apart", config.reconnect.attempts, config.reconnect.delay_ms);
    println!();
    println!("Cache Configuration:");
    println!("  Subject Cache:  {}", if config.cache.enabled { "enabled" } else { "disabled" });
    println!("  Bounds:         {} bytes, {} elements", config.cache.max_bytes, config.cache.max_elements);
    println!("  Freshness:      {} s", config.cache.freshness_secs);
    println!();
    println!("Session Configuration:");
    println!("  Backend:        {:?}", config.session.backend);
    println!("  Validity:       {} s", config.session.validity_secs);
    println!("  Refresh:        {} s", config.session.refresh_secs);
    println!("  Sizes:          {} sessions, {} logins", config.session.max_sessions, config.session.max_logins);
    println!();
    println!("Workers:          {}", if config.workers.count > 0 {
        config.workers.count.to_string()
    } else {
        format!("auto ({})", tuned.workers)
    });
    println!("{}", tuning::tuning_summary(&tuned));

    Ok(())
}
