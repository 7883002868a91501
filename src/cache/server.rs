//! Shared Session Cache Server
//!
//! Hosts the session and login namespaces for any number of replicas.
//! Entries live in two [`LocalSessionStore`]s with the same bulk eviction
//! a replica applies locally.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::protocol::{read_frame, write_frame, CacheReply, CacheRequest, Namespace};
use super::session::LocalSessionStore;
use crate::config::SessionConfig;
use crate::error::{Error, Result};

/// The two namespaces served
pub struct SharedNamespaces {
    sessions: LocalSessionStore,
    logins: LocalSessionStore,
}

impl SharedNamespaces {
    pub fn new(max_sessions: usize, max_logins: usize) -> Self {
        Self {
            sessions: LocalSessionStore::new("session", max_sessions),
            logins: LocalSessionStore::new("login", max_logins),
        }
    }

    fn store(&self, namespace: Namespace) -> &LocalSessionStore {
        match namespace {
            Namespace::Session => &self.sessions,
            Namespace::Login => &self.logins,
        }
    }

    /// Apply one request
    pub fn handle(&self, request: CacheRequest) -> CacheReply {
        match request {
            CacheRequest::Add {
                namespace,
                key,
                entry,
            } => {
                self.store(namespace).insert(&key, entry);
                CacheReply::Done
            }
            CacheRequest::Get { namespace, key } => {
                CacheReply::Entry(self.store(namespace).get(&key))
            }
            CacheRequest::Remove { namespace, key } => {
                self.store(namespace).remove(&key);
                CacheReply::Done
            }
            CacheRequest::Size { namespace } => CacheReply::Size(self.store(namespace).len() as u64),
        }
    }
}

/// TCP server for the shared session cache
pub struct SessionCacheServer {
    bind_address: String,
    namespaces: Arc<SharedNamespaces>,
    shutdown: watch::Sender<bool>,
}

impl SessionCacheServer {
    pub fn new(bind_address: String, config: &SessionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_address,
            namespaces: Arc::new(SharedNamespaces::new(config.max_sessions, config.max_logins)),
            shutdown,
        }
    }

    pub fn namespaces(&self) -> &Arc<SharedNamespaces> {
        &self.namespaces
    }

    /// Bind and serve until [`stop`](Self::stop) is called
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Shared session cache listening on {}",
            listener.local_addr()?
        );
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer = addr.to_string();
                            let namespaces = Arc::clone(&self.namespaces);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer, namespaces).await {
                                    tracing::warn!("Session cache connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Shared session cache stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: &str,
    namespaces: Arc<SharedNamespaces>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request: CacheRequest = match read_frame(&mut reader).await {
            Ok(request) => request,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!("Bad session cache request from {}: {}", peer, e);
                write_frame(&mut writer, &CacheReply::Error(e.to_string())).await?;
                break;
            }
        };

        tracing::trace!("Session cache {} from {}", request.type_name(), peer);
        let reply = namespaces.handle(request);
        write_frame(&mut writer, &reply).await?;
    }

    Ok(())
}
