//! Request Gate
//!
//! Classifies inbound requests and turns mutating requests away from
//! non-leader replicas with a retry acknowledgement. Everything else goes
//! to the directory handlers on the caller's connection.

mod request;

pub use request::{Access, Reply, ReplyStatus, Request, RequestKind, Response};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::directory::Directory;
use crate::error::Result;
use crate::state::RoleTracker;
use crate::store::{StoreDriver, WriteGate};

/// Entry point for every directory request
pub struct RequestGate {
    role: Arc<RoleTracker>,
    directory: Arc<Directory>,
    retries: AtomicU64,
}

impl RequestGate {
    pub fn new(role: Arc<RoleTracker>, directory: Arc<Directory>) -> Self {
        Self {
            role,
            directory,
            retries: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn role(&self) -> &Arc<RoleTracker> {
        &self.role
    }

    /// Retry acknowledgements handed out so far
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Execute or defer a request. Store errors other than gate refusals
    /// are returned to the caller.
    pub async fn try_dispatch<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        request: Request,
    ) -> Result<Response> {
        let kind = request.kind();
        if kind.is_mutating() && !self.role.is_leader() {
            tracing::debug!("Deferring {} request, not leader", kind);
            return Ok(self.retry());
        }

        match self.directory.handle(conn, request).await {
            Ok(reply) => Ok(Response::Reply(reply)),
            // Queued while leader, executed after a demotion
            Err(e) if e.is_gate_refusal() => {
                tracing::info!("Demoted while handling {} request: {}", kind, e);
                Ok(self.retry())
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`try_dispatch`](Self::try_dispatch), but store errors become a
    /// `NOT_OK` reply
    pub async fn dispatch<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        request: Request,
    ) -> Response {
        let kind = request.kind();
        match self.try_dispatch(conn, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("{} request failed: {}", kind, e);
                Response::Reply(Reply::status(ReplyStatus::NotOk).with_message(e.to_string()))
            }
        }
    }

    fn retry(&self) -> Response {
        self.retries.fetch_add(1, Ordering::Relaxed);
        Response::Retry
    }
}
