//! Write Gate
//!
//! Wraps a store driver and refuses every mutating statement while this
//! replica is not the leader. A refused write poisons the connection: until
//! it is re-established with `connect` or `ping`, nothing else goes through,
//! so a multi-statement write can never straddle a demotion.

use std::sync::Arc;

use super::{is_read_only, preview, QueryResult, Statement, StoreDriver};
use crate::error::{Error, Result};
use crate::state::RoleTracker;

/// Predicate consulted before each mutating statement
pub type LeaderCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Connection state as seen by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Clean,
    Poisoned,
}

/// Store driver that blocks writes on non-leaders
pub struct WriteGate<D> {
    inner: D,
    is_leader: LeaderCheck,
    state: GateState,
    blocked_writes: u64,
}

impl<D: StoreDriver> WriteGate<D> {
    /// Wrap a driver with an arbitrary leadership predicate
    pub fn new(inner: D, is_leader: LeaderCheck) -> Self {
        Self {
            inner,
            is_leader,
            state: GateState::Clean,
            blocked_writes: 0,
        }
    }

    /// Wrap a driver, gating on the replica role
    pub fn for_role(inner: D, role: Arc<RoleTracker>) -> Self {
        Self::new(inner, Arc::new(move || role.is_leader()))
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == GateState::Poisoned
    }

    /// Writes refused since this gate was created
    pub fn blocked_writes(&self) -> u64 {
        self.blocked_writes
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Decide whether a statement may reach the driver
    ///
    /// While poisoned every statement is refused, reads included, until
    /// `connect` or `ping` resets the connection.
    fn admit(&mut self, sql: &str) -> Result<()> {
        if self.is_poisoned() {
            return Err(Error::PoisonedConnection);
        }

        if is_read_only(sql) || (self.is_leader)() {
            return Ok(());
        }

        self.state = GateState::Poisoned;
        self.blocked_writes += 1;
        tracing::warn!(
            "Blocked write on non-leader replica, connection poisoned: {}",
            preview(sql)
        );
        Err(Error::NotLeaderWrite {
            statement: preview(sql).to_string(),
        })
    }

    fn check_clean(&self) -> Result<()> {
        if self.is_poisoned() {
            Err(Error::PoisonedConnection)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl<D: StoreDriver> StoreDriver for WriteGate<D> {
    async fn connect(&mut self) -> Result<()> {
        self.inner.connect().await?;
        self.state = GateState::Clean;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.inner.ping().await?;
        self.state = GateState::Clean;
        Ok(())
    }

    async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.admit(sql)?;
        self.inner.prepare(sql).await
    }

    async fn execute(&mut self, statement: &Statement) -> Result<QueryResult> {
        self.admit(statement.sql())?;
        self.inner.execute(statement).await
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.check_clean()?;
        self.inner.begin_transaction().await
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.check_clean()?;
        self.inner.commit_transaction().await
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.check_clean()?;
        self.inner.rollback_transaction().await
    }
}
