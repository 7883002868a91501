//! Driver Counters
//!
//! Counts calls that actually reach a store driver. Workers wrap their
//! driver in one of these so `/status` can report statement traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{QueryResult, Statement, StoreDriver};
use crate::error::Result;

/// Call counters, shareable across drivers
#[derive(Debug, Default)]
pub struct DriverCounters {
    connects: AtomicU64,
    pings: AtomicU64,
    prepares: AtomicU64,
    executes: AtomicU64,
    transactions: AtomicU64,
}

impl DriverCounters {
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    pub fn prepares(&self) -> u64 {
        self.prepares.load(Ordering::Relaxed)
    }

    pub fn executes(&self) -> u64 {
        self.executes.load(Ordering::Relaxed)
    }

    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    /// Statements that reached the store (prepare + execute)
    pub fn statements(&self) -> u64 {
        self.prepares() + self.executes()
    }
}

/// Driver wrapper that counts delegated calls
pub struct CountingDriver<D> {
    inner: D,
    counters: Arc<DriverCounters>,
}

impl<D: StoreDriver> CountingDriver<D> {
    pub fn new(inner: D) -> Self {
        Self::with_counters(inner, Arc::new(DriverCounters::default()))
    }

    pub fn with_counters(inner: D, counters: Arc<DriverCounters>) -> Self {
        Self { inner, counters }
    }

    pub fn counters(&self) -> &Arc<DriverCounters> {
        &self.counters
    }
}

#[async_trait::async_trait]
impl<D: StoreDriver> StoreDriver for CountingDriver<D> {
    async fn connect(&mut self) -> Result<()> {
        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        self.inner.connect().await
    }

    async fn ping(&mut self) -> Result<()> {
        self.counters.pings.fetch_add(1, Ordering::Relaxed);
        self.inner.ping().await
    }

    async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.counters.prepares.fetch_add(1, Ordering::Relaxed);
        self.inner.prepare(sql).await
    }

    async fn execute(&mut self, statement: &Statement) -> Result<QueryResult> {
        self.counters.executes.fetch_add(1, Ordering::Relaxed);
        self.inner.execute(statement).await
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.counters.transactions.fetch_add(1, Ordering::Relaxed);
        self.inner.begin_transaction().await
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.inner.commit_transaction().await
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.inner.rollback_transaction().await
    }
}
