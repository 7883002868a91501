//! Shared Session Store Client
//!
//! Session store backed by the shared cache server, so every replica sees
//! the same sessions and logins. The server is a cache: when it cannot be
//! reached, lookups miss and writes are dropped, and callers fall through to
//! the backing store.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::protocol::{read_frame, write_frame, CacheReply, CacheRequest, Namespace};
use super::session::{SessionEntry, SessionStore};
use crate::error::{Error, Result};

/// Idle connections kept per client
pub const MAX_IDLE_CONNECTIONS: usize = 10;

/// Client for one namespace on the shared cache server
///
/// Requests run concurrently, each on its own connection taken from a small
/// idle pool. The request timeout covers the checkout as well as the round
/// trip.
pub struct SharedSessionStore {
    address: String,
    namespace: Namespace,
    request_timeout: Duration,
    idle: Mutex<Vec<TcpStream>>,
}

impl SharedSessionStore {
    pub fn new(address: String, namespace: Namespace, request_timeout: Duration) -> Self {
        Self {
            address,
            namespace,
            request_timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Number of pooled connections waiting for a request
    pub async fn idle_connections(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Send a request and wait for the reply
    pub async fn request(&self, request: CacheRequest) -> Result<CacheReply> {
        let result = timeout(self.request_timeout, async {
            let pooled = self.idle.lock().await.pop();
            let mut stream = match pooled {
                Some(stream) => stream,
                None => self.connect().await?,
            };
            write_frame(&mut stream, &request).await?;
            let reply = read_frame::<CacheReply, _>(&mut stream).await?;
            Ok::<_, Error>((stream, reply))
        })
        .await;

        // A failed stream may hold half a frame and is dropped
        match result {
            Ok(Ok((stream, reply))) => {
                let mut idle = self.idle.lock().await;
                if idle.len() < MAX_IDLE_CONNECTIONS {
                    idle.push(stream);
                }
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        match TcpStream::connect(&self.address).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::debug!("Connected to shared session cache at {}", self.address);
                Ok(stream)
            }
            Err(e) => Err(Error::ConnectionFailed {
                address: self.address.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn degraded(&self, request: &str, error: &Error) {
        tracing::warn!(
            namespace = %self.namespace,
            "Shared session cache {} failed, treating as miss: {}",
            request,
            error
        );
    }
}

#[async_trait::async_trait]
impl SessionStore for SharedSessionStore {
    async fn add_entry(&self, key: &str, entry: SessionEntry) {
        let request = CacheRequest::Add {
            namespace: self.namespace,
            key: key.to_string(),
            entry,
        };
        match self.request(request).await {
            Ok(CacheReply::Done) => {}
            Ok(other) => tracing::warn!("Unexpected reply to Add: {:?}", other),
            Err(e) => self.degraded("Add", &e),
        }
    }

    async fn get_entry(&self, key: &str) -> Option<SessionEntry> {
        let request = CacheRequest::Get {
            namespace: self.namespace,
            key: key.to_string(),
        };
        match self.request(request).await {
            Ok(CacheReply::Entry(entry)) => entry,
            Ok(other) => {
                tracing::warn!("Unexpected reply to Get: {:?}", other);
                None
            }
            Err(e) => {
                self.degraded("Get", &e);
                None
            }
        }
    }

    async fn remove_entry(&self, key: &str) {
        let request = CacheRequest::Remove {
            namespace: self.namespace,
            key: key.to_string(),
        };
        if let Err(e) = self.request(request).await {
            self.degraded("Remove", &e);
        }
    }

    async fn size(&self) -> usize {
        let request = CacheRequest::Size {
            namespace: self.namespace,
        };
        match self.request(request).await {
            Ok(CacheReply::Size(size)) => size as usize,
            Ok(_) => 0,
            Err(e) => {
                self.degraded("Size", &e);
                0
            }
        }
    }
}
