//! Cache Module
//!
//! Subject record cache and the session/login directories.

pub mod entry;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shared;

pub use entry::{CacheSize, CacheStats, Cached, EntryCache, EntryHandle};
pub use server::SessionCacheServer;
pub use session::{
    login_key, Freshness, LocalSessionStore, SessionDirectory, SessionEntry, SessionStore,
};
pub use shared::SharedSessionStore;
