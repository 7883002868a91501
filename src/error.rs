//! WolfDir Error Types

use thiserror::Error;

/// Result type alias for WolfDir operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfDir error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Backing store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Embedded database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    #[error("Not connected to the backing store")]
    NotConnected,

    #[error("Backing store unavailable after {attempts} attempts")]
    StoreUnavailable { attempts: u32 },

    // Write gating
    #[error("Write blocked on non-leader replica: {statement}")]
    NotLeaderWrite { statement: String },

    #[error("Connection poisoned by a blocked write, reconnect required")]
    PoisonedConnection,

    // Shared cache transport
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeaderWrite { .. }
                | Error::PoisonedConnection
                | Error::ConnectionTimeout(_)
                | Error::Network(_)
        )
    }

    /// Check if this error must take the process down
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StoreUnavailable { .. })
    }

    /// Check if this error came from the write gate
    pub fn is_gate_refusal(&self) -> bool {
        matches!(self, Error::NotLeaderWrite { .. } | Error::PoisonedConnection)
    }
}
