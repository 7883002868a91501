//! WolfDir - Replicated Directory Service
//!
//! Subject records, credentials and sessions served by a set of replicas
//! that share one relational backing store. One replica at a time is the
//! leader and may write; followers serve reads from local caches.
//!
//! # Architecture
//!
//! Requests enter the [`gate::RequestGate`], which turns mutating requests
//! away from followers with a retry acknowledgement. Handlers read through
//! the subject cache and the session directory and reach the store over a
//! per-worker [`store::WriteGate`], which refuses any mutating statement
//! while the replica is not leader.
//!
//! # Features
//!
//! - Write gating with connection poisoning across demotion races
//! - Subject record cache with per-key singleflight and LRU sweeps
//! - Session and login caches, in-process or on a shared cache server
//! - Seeded one-way credential hashing with legacy plaintext migration
//! - HTTP API for requests, status and role changes

pub mod api;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod gate;
pub mod server;
pub mod state;
pub mod store;
pub mod tuning;

pub use config::WolfDirConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfDirConfig;
    pub use crate::error::{Error, Result};
    pub use crate::gate::{Reply, ReplyStatus, Request, RequestGate, Response};
    pub use crate::state::{Role, RoleTracker};
    pub use crate::store::{StoreDriver, WriteGate};
}
