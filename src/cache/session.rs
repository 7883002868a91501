//! Session Directory
//!
//! Two independent caches: active sessions keyed by session id, and login
//! verification results keyed by lowercased logon id. Either may live in
//! this process or in the shared cache server; callers see the same
//! contract both ways.
//!
//! Validity is checked by callers against `last_access`; nothing here
//! expires entries on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::protocol::Namespace;
use super::shared::SharedSessionStore;
use crate::clock::{age, Timestamp};
use crate::config::{SessionBackend, SessionConfig};
use crate::error::{Error, Result};

/// A cached session or login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Session key, or the stored credential for logins
    pub secret: String,
    pub subject_id: u32,
    pub last_access: Timestamp,
}

impl SessionEntry {
    pub fn new(secret: impl Into<String>, subject_id: u32, last_access: Timestamp) -> Self {
        Self {
            secret: secret.into(),
            subject_id,
            last_access,
        }
    }
}

/// Storage for one session namespace
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn add_entry(&self, key: &str, entry: SessionEntry);

    async fn get_entry(&self, key: &str) -> Option<SessionEntry>;

    async fn remove_entry(&self, key: &str);

    async fn size(&self) -> usize;
}

/// In-process session store
///
/// Inserting past `max_size` evicts the `max_size / 2 + 1` entries with the
/// oldest access times in one sweep.
pub struct LocalSessionStore {
    name: &'static str,
    max_size: usize,
    entries: Mutex<HashMap<String, SessionEntry>>,
}

impl LocalSessionStore {
    pub fn new(name: &'static str, max_size: usize) -> Self {
        Self {
            name,
            max_size,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace an entry, returning how many entries were evicted
    pub fn insert(&self, key: &str, entry: SessionEntry) -> usize {
        let mut entries = self.lock();
        entries.insert(key.to_string(), entry);

        if entries.len() <= self.max_size {
            return 0;
        }

        let mut by_age: Vec<(Timestamp, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.last_access, key.clone()))
            .collect();
        by_age.sort_unstable();

        let evict = (self.max_size / 2 + 1).min(by_age.len());
        for (_, key) in by_age.into_iter().take(evict) {
            entries.remove(&key);
        }

        tracing::info!(
            cache = self.name,
            evicted = evict,
            remaining = entries.len(),
            "Session cache swept"
        );
        evict
    }

    pub fn get(&self, key: &str) -> Option<SessionEntry> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl SessionStore for LocalSessionStore {
    async fn add_entry(&self, key: &str, entry: SessionEntry) {
        self.insert(key, entry);
    }

    async fn get_entry(&self, key: &str) -> Option<SessionEntry> {
        self.get(key)
    }

    async fn remove_entry(&self, key: &str) {
        self.remove(key);
    }

    async fn size(&self) -> usize {
        self.len()
    }
}

/// How a cached entry stands against the validity and refresh windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Still valid, but the stored access time should be written back
    NeedsRefresh,
    Expired,
}

/// Cache key for a logon id
pub fn login_key(logon_id: &str) -> String {
    logon_id.to_lowercase()
}

/// The session and login caches with their time windows
#[derive(Clone)]
pub struct SessionDirectory {
    sessions: Arc<dyn SessionStore>,
    logins: Arc<dyn SessionStore>,
    validity: u64,
    refresh: u64,
}

impl SessionDirectory {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        logins: Arc<dyn SessionStore>,
        validity: Duration,
        refresh: Duration,
    ) -> Self {
        Self {
            sessions,
            logins,
            validity: validity.as_secs(),
            refresh: refresh.as_secs(),
        }
    }

    /// Build both caches on the configured backend
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let (sessions, logins): (Arc<dyn SessionStore>, Arc<dyn SessionStore>) =
            match config.backend {
                SessionBackend::Local => (
                    Arc::new(LocalSessionStore::new("session", config.max_sessions)),
                    Arc::new(LocalSessionStore::new("login", config.max_logins)),
                ),
                SessionBackend::Shared => {
                    let address = config.shared_address.clone().ok_or_else(|| {
                        Error::Config("session.shared_address is required".into())
                    })?;
                    (
                        Arc::new(SharedSessionStore::new(
                            address.clone(),
                            Namespace::Session,
                            config.request_timeout(),
                        )),
                        Arc::new(SharedSessionStore::new(
                            address,
                            Namespace::Login,
                            config.request_timeout(),
                        )),
                    )
                }
            };

        Ok(Self::new(
            sessions,
            logins,
            Duration::from_secs(config.validity_secs),
            Duration::from_secs(config.refresh_secs),
        ))
    }

    pub fn sessions(&self) -> &dyn SessionStore {
        self.sessions.as_ref()
    }

    pub fn logins(&self) -> &dyn SessionStore {
        self.logins.as_ref()
    }

    pub fn validity_secs(&self) -> u64 {
        self.validity
    }

    pub fn freshness(&self, entry: &SessionEntry, now: Timestamp) -> Freshness {
        let age = age(now, entry.last_access);
        if age >= self.validity {
            Freshness::Expired
        } else if age >= self.refresh {
            Freshness::NeedsRefresh
        } else {
            Freshness::Fresh
        }
    }
}
