//! Worker Pool
//!
//! A fixed set of request workers sharing one job queue. Every worker owns
//! a private write-gated connection; gate state is never shared between
//! workers. A worker that cannot reach the store within the reconnect
//! budget reports on the fatal channel and stops.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::ReconnectConfig;
use crate::error::{Error, Result};
use crate::gate::{Reply, ReplyStatus, Request, RequestGate, Response};
use crate::store::{connect_with_retry, CountingDriver, DriverCounters, StoreDriver, WriteGate};

/// A queued request and where to send its response
struct Job {
    request: Request,
    reply: oneshot::Sender<Response>,
}

type JobQueue = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Pool of request workers
pub struct WorkerPool {
    sender: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<DriverCounters>,
    workers: usize,
}

impl WorkerPool {
    /// Spawn `workers` workers, each with a driver from `new_driver`
    pub fn start<D, F>(
        gate: Arc<RequestGate>,
        mut new_driver: F,
        workers: usize,
        queue_depth: usize,
        reconnect: ReconnectConfig,
        fatal: mpsc::UnboundedSender<Error>,
    ) -> Self
    where
        D: StoreDriver + 'static,
        F: FnMut() -> D,
    {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let queue: JobQueue = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(DriverCounters::default());

        let handles = (0..workers)
            .map(|id| {
                let conn = WriteGate::for_role(
                    CountingDriver::with_counters(new_driver(), Arc::clone(&counters)),
                    Arc::clone(gate.role()),
                );
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&gate),
                    conn,
                    Arc::clone(&queue),
                    reconnect.clone(),
                    fatal.clone(),
                ))
            })
            .collect();

        tracing::info!(workers, queue_depth, "Worker pool started");

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            handles: std::sync::Mutex::new(handles),
            counters,
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Calls reaching the store, summed over all workers
    pub fn counters(&self) -> &Arc<DriverCounters> {
        &self.counters
    }

    /// Queue a request and wait for its response
    pub async fn submit(&self, request: Request) -> Result<Response> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| Error::Internal("worker pool lock poisoned".into()))?
            .clone()
            .ok_or(Error::ShuttingDown)?;

        let (reply, response) = oneshot::channel();
        sender
            .send(Job { request, reply })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)
    }

    /// Stop taking requests; workers finish queued jobs and exit
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn run_worker<D: StoreDriver>(
    id: usize,
    gate: Arc<RequestGate>,
    mut conn: WriteGate<D>,
    queue: JobQueue,
    reconnect: ReconnectConfig,
    fatal: mpsc::UnboundedSender<Error>,
) {
    if let Err(e) = connect_with_retry(&mut conn, &reconnect).await {
        tracing::error!(worker = id, "Worker could not reach the backing store: {}", e);
        let _ = fatal.send(e);
        return;
    }
    tracing::debug!(worker = id, "Worker connected");

    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        let kind = job.request.kind();
        let mut suspect = false;
        let response = match gate.try_dispatch(&mut conn, job.request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(worker = id, "{} request failed: {}", kind, e);
                suspect = true;
                Response::Reply(Reply::status(ReplyStatus::NotOk).with_message(e.to_string()))
            }
        };
        if job.reply.send(response).is_err() {
            tracing::debug!(worker = id, "Requester went away before the reply");
        }

        if conn.is_poisoned() || suspect {
            if let Err(e) = recover(id, &mut conn, &reconnect).await {
                tracing::error!(worker = id, "Worker lost the backing store: {}", e);
                let _ = fatal.send(e);
                break;
            }
        }
    }

    tracing::debug!(worker = id, "Worker stopped");
}

/// Get a usable connection back. A poisoned gate always gets a fresh
/// connection so nothing from an interrupted transaction survives.
async fn recover<D: StoreDriver>(
    id: usize,
    conn: &mut WriteGate<D>,
    reconnect: &ReconnectConfig,
) -> Result<()> {
    if conn.is_poisoned() {
        tracing::info!(worker = id, "Reconnecting poisoned connection");
        match conn.connect().await {
            Ok(()) => return Ok(()),
            Err(e) => tracing::warn!(worker = id, "Reconnect failed: {}", e),
        }
    }
    connect_with_retry(conn, reconnect).await
}
