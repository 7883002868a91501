//! Backing Store Module
//!
//! The relational store every replica shares. Drivers own exactly one
//! connection and are owned by exactly one worker.

mod counting;
mod gate;
mod mariadb;
mod sqlite;

pub use counting::{CountingDriver, DriverCounters};
pub use gate::{GateState, LeaderCheck, WriteGate};
pub use mariadb::MariaDbDriver;
pub use sqlite::SqliteDriver;

use serde::{Deserialize, Serialize};

use crate::config::ReconnectConfig;
use crate::error::{Error, Result};

/// The keyword a statement must start with to count as read-only
const READ_KEYWORD: &str = "SELECT";

/// Check if a SQL statement only reads
pub fn is_read_only(sql: &str) -> bool {
    sql.trim_start()
        .get(..READ_KEYWORD.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(READ_KEYWORD))
        .unwrap_or(false)
}

/// Shorten a statement for log output
pub(crate) fn preview(sql: &str) -> &str {
    let sql = sql.trim();
    match sql.char_indices().nth(60) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

/// A bound parameter or a column value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A SQL statement with its bound parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn is_read_only(&self) -> bool {
        is_read_only(&self.sql)
    }
}

/// One result row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        match self.values.get(idx)? {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Null => None,
        }
    }

    pub fn get_str(&self, idx: usize) -> Option<&str> {
        match self.values.get(idx)? {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_string(&self, idx: usize) -> Option<String> {
        match self.values.get(idx)? {
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Int(v) => Some(v.to_string()),
            SqlValue::Null => None,
        }
    }
}

/// Outcome of executing a statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    rows: Vec<Row>,
    rows_affected: u64,
    last_insert_id: Option<i64>,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            rows_affected: rows.len() as u64,
            rows,
            last_insert_id: None,
        }
    }

    pub fn affected(rows_affected: u64, last_insert_id: Option<i64>) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
            last_insert_id,
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn last_insert_id(&self) -> Option<i64> {
        self.last_insert_id
    }
}

/// A connection to the backing store
#[async_trait::async_trait]
pub trait StoreDriver: Send {
    /// Open (or re-open) the connection
    async fn connect(&mut self) -> Result<()>;

    /// Check the connection is alive
    async fn ping(&mut self) -> Result<()>;

    /// Validate a statement against the store
    async fn prepare(&mut self, sql: &str) -> Result<Statement>;

    /// Run a statement
    async fn execute(&mut self, statement: &Statement) -> Result<QueryResult>;

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit_transaction(&mut self) -> Result<()>;

    async fn rollback_transaction(&mut self) -> Result<()>;
}

/// Bring a driver to a working connection, pinging and reconnecting up to
/// the configured budget with a fixed delay between attempts.
///
/// Returns [`Error::StoreUnavailable`] once the budget is spent; callers treat
/// that as fatal.
pub async fn connect_with_retry<D: StoreDriver + ?Sized>(
    driver: &mut D,
    policy: &ReconnectConfig,
) -> Result<()> {
    for attempt in 1..=policy.attempts {
        let outcome = match driver.ping().await {
            Ok(()) => Ok(()),
            Err(_) => match driver.connect().await {
                Ok(()) => driver.ping().await,
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!("Backing store reachable again after {} attempts", attempt);
                }
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(
                    "Backing store attempt {}/{} failed: {}",
                    attempt,
                    policy.attempts,
                    e
                );
            }
        }

        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay()).await;
        }
    }

    Err(Error::StoreUnavailable {
        attempts: policy.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_classification() {
        assert!(is_read_only("SELECT * FROM dir_subject"));
        assert!(is_read_only("  select uin from dir_subject"));
        assert!(is_read_only("\n\tSeLeCt 1"));
        assert!(!is_read_only("INSERT INTO dir_subject VALUES (1)"));
        assert!(!is_read_only("UPDATE dir_subject SET email = ''"));
        assert!(!is_read_only("DELETE FROM dir_session"));
        assert!(!is_read_only("CREATE TABLE t (a INT)"));
        assert!(!is_read_only("SEL"));
        assert!(!is_read_only(""));
    }

    #[test]
    fn test_row_accessors() {
        let row = Row::new(vec![
            SqlValue::Int(42),
            SqlValue::Text("alice".into()),
            SqlValue::Null,
            SqlValue::Text("17".into()),
        ]);

        assert_eq!(row.get_i64(0), Some(42));
        assert_eq!(row.get_str(1), Some("alice"));
        assert_eq!(row.get_string(0).as_deref(), Some("42"));
        assert_eq!(row.get_i64(2), None);
        assert_eq!(row.get_i64(3), Some(17));
        assert_eq!(row.get(9), None);
    }

    #[test]
    fn test_statement_binding() {
        let stmt = Statement::new("SELECT * FROM t WHERE a = ? AND b = ?")
            .bind(7u32)
            .bind(None::<String>);
        assert_eq!(stmt.params(), &[SqlValue::Int(7), SqlValue::Null]);
        assert!(stmt.is_read_only());
    }

    #[test]
    fn test_preview_is_bounded() {
        let long = "INSERT ".repeat(40);
        assert!(preview(&long).chars().count() <= 60);
        assert_eq!(preview("  SELECT 1  "), "SELECT 1");
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let mut driver = SqliteDriver::new("/nonexistent-dir/wolfdir/none.db");
        let policy = ReconnectConfig {
            attempts: 3,
            delay_ms: 1,
        };

        let err = connect_with_retry(&mut driver, &policy).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { attempts: 3 }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_connect_with_retry_connects() {
        let mut driver = SqliteDriver::memory("retry-connects");
        let policy = ReconnectConfig::default();

        connect_with_retry(&mut driver, &policy).await.unwrap();
        driver.ping().await.unwrap();
    }
}
