//! WolfDir Configuration
//!
//! This module provides configuration structures for a WolfDir directory
//! replica. Everything here is read once at startup and handed to
//! constructors; nothing is kept in globals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main WolfDir configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfDirConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Backing store configuration
    pub database: DatabaseConfig,

    /// Backing store reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Subject record cache
    #[serde(default)]
    pub cache: CacheConfig,

    /// Session and login caches
    #[serde(default)]
    pub session: SessionConfig,

    /// Request workers
    #[serde(default)]
    pub workers: WorkerConfig,

    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Shared session cache server
    #[serde(default)]
    pub cache_server: CacheServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Start in the leader role (single replica deployments)
    #[serde(default)]
    pub bootstrap_leader: bool,
}

/// Which store driver to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Mariadb,
    Sqlite,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Store driver
    #[serde(default)]
    pub driver: DriverKind,

    /// MariaDB host
    #[serde(default)]
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    #[serde(default)]
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    #[serde(default)]
    pub database: Option<String>,

    /// SQLite database file for the embedded driver
    #[serde(default = "default_sqlite_path")]
    pub path: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Create missing tables at startup
    #[serde(default = "default_true")]
    pub update_schema: bool,
}

/// Backing store reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Ping/reconnect attempts before giving up
    #[serde(default = "default_reconnect_attempts")]
    pub attempts: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub delay_ms: u64,
}

/// Subject record cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Use the subject record cache
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum total size of cached records in bytes
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,

    /// Maximum number of cached records
    #[serde(default = "default_cache_max_elements")]
    pub max_elements: usize,

    /// Age after which a cached record is refetched
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
}

/// Where session and login entries are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionBackend {
    /// In this process
    #[default]
    Local,
    /// In a shared cache server reachable by all replicas
    Shared,
}

/// Session and login cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long an unused session or login stays valid
    #[serde(default = "default_session_validity_secs")]
    pub validity_secs: u64,

    /// How stale an access time may get before it is written back
    #[serde(default = "default_session_refresh_secs")]
    pub refresh_secs: u64,

    /// Age after which sessions are moved to history
    #[serde(default = "default_session_history_secs")]
    pub history_secs: u64,

    /// Maximum cached sessions
    #[serde(default = "default_session_max_entries")]
    pub max_sessions: usize,

    /// Maximum cached logins
    #[serde(default = "default_session_max_entries")]
    pub max_logins: usize,

    /// Session cache backend
    #[serde(default)]
    pub backend: SessionBackend,

    /// Shared cache server address (host:port)
    #[serde(default)]
    pub shared_address: Option<String>,

    /// Shared cache request timeout in milliseconds
    #[serde(default = "default_shared_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Request worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerConfig {
    /// Number of workers (0 = auto-tune)
    #[serde(default)]
    pub count: usize,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Shared session cache server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheServerConfig {
    /// Listen address
    #[serde(default = "default_cache_server_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_sqlite_path() -> String {
    "wolfdir.db".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_cache_max_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_cache_max_elements() -> usize {
    10_000
}

fn default_freshness_secs() -> u64 {
    30 * 60
}

fn default_session_validity_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_session_refresh_secs() -> u64 {
    5 * 60
}

fn default_session_history_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_session_max_entries() -> usize {
    50_000
}

fn default_shared_timeout_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_cache_server_address() -> String {
    "0.0.0.0:8091".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_reconnect_attempts(),
            delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: default_cache_max_bytes(),
            max_elements: default_cache_max_elements(),
            freshness_secs: default_freshness_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            validity_secs: default_session_validity_secs(),
            refresh_secs: default_session_refresh_secs(),
            history_secs: default_session_history_secs(),
            max_sessions: default_session_max_entries(),
            max_logins: default_session_max_entries(),
            backend: SessionBackend::Local,
            shared_address: None,
            request_timeout_ms: default_shared_timeout_ms(),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_address(),
        }
    }
}

impl Default for CacheServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_cache_server_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfDirConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfDirConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        match self.database.driver {
            DriverKind::Mariadb if self.database.host.is_empty() => {
                return Err(crate::Error::Config("database.host cannot be empty".into()));
            }
            DriverKind::Sqlite if self.database.path.is_empty() => {
                return Err(crate::Error::Config("database.path cannot be empty".into()));
            }
            _ => {}
        }

        if self.reconnect.attempts == 0 {
            return Err(crate::Error::Config("reconnect.attempts must be at least 1".into()));
        }

        if self.cache.max_bytes == 0 || self.cache.max_elements == 0 {
            return Err(crate::Error::Config("cache bounds must be non-zero".into()));
        }

        if self.session.refresh_secs >= self.session.validity_secs {
            return Err(crate::Error::Config(
                "session.refresh_secs must be less than session.validity_secs".into(),
            ));
        }

        if self.session.history_secs <= self.session.validity_secs {
            return Err(crate::Error::Config(
                "session.history_secs must be greater than session.validity_secs".into(),
            ));
        }

        if self.session.max_sessions == 0 || self.session.max_logins == 0 {
            return Err(crate::Error::Config("session cache sizes must be non-zero".into()));
        }

        if self.session.backend == SessionBackend::Shared && self.session.shared_address.is_none() {
            return Err(crate::Error::Config(
                "session.shared_address is required for the shared backend".into(),
            ));
        }

        Ok(())
    }

    /// Subject record freshness window
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.cache.freshness_secs)
    }
}
