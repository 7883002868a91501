//! MariaDB Driver
//!
//! Talks to the shared MariaDB server over a single sqlx connection. Each
//! request worker owns one of these, so the write gate wrapped around it
//! never has to be shared.

use std::time::Duration;

use sqlx::mysql::{MySqlConnection, MySqlRow};
use sqlx::{Connection, Executor, Row as _};

use super::{preview, QueryResult, Row, SqlValue, Statement, StoreDriver};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// MariaDB store driver
pub struct MariaDbDriver {
    /// Connection URL (contains credentials, never logged)
    url: String,
    /// host:port for diagnostics
    address: String,
    connect_timeout: Duration,
    conn: Option<MySqlConnection>,
}

impl MariaDbDriver {
    /// Create an unconnected driver from the database configuration
    pub fn new(config: &DatabaseConfig) -> Self {
        let url = match &config.database {
            Some(db) => format!(
                "mysql://{}:{}@{}:{}/{}",
                config.user, config.password, config.host, config.port, db
            ),
            None => format!(
                "mysql://{}:{}@{}:{}",
                config.user, config.password, config.host, config.port
            ),
        };

        Self {
            url,
            address: format!("{}:{}", config.host, config.port),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            conn: None,
        }
    }

    fn conn(&mut self) -> Result<&mut MySqlConnection> {
        self.conn.as_mut().ok_or(Error::NotConnected)
    }

    /// Run a statement over the text protocol (transaction control)
    async fn run_plain(&mut self, sql: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(sql).await?;
        Ok(())
    }
}

fn convert_row(row: &MySqlRow) -> Row {
    let values = (0..row.len())
        .map(|idx| {
            if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                return v.map(SqlValue::Int).unwrap_or(SqlValue::Null);
            }
            if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
                return v.map(|v| SqlValue::Int(v as i64)).unwrap_or(SqlValue::Null);
            }
            if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
                return v.map(SqlValue::Text).unwrap_or(SqlValue::Null);
            }
            SqlValue::Null
        })
        .collect();
    Row::new(values)
}

#[async_trait::async_trait]
impl StoreDriver for MariaDbDriver {
    async fn connect(&mut self) -> Result<()> {
        let conn = match tokio::time::timeout(
            self.connect_timeout,
            MySqlConnection::connect(&self.url),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: self.address.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(self.address.clone())),
        };

        if let Some(old) = self.conn.replace(conn) {
            if let Err(e) = old.close().await {
                tracing::debug!("Closing replaced MariaDB connection failed: {}", e);
            }
        }

        tracing::debug!("Connected to MariaDB at {}", self.address);
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn()?.ping().await?;
        Ok(())
    }

    async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        let conn = self.conn()?;
        conn.prepare(sql).await?;
        Ok(Statement::new(sql))
    }

    async fn execute(&mut self, statement: &Statement) -> Result<QueryResult> {
        let conn = self.conn()?;

        let mut query = sqlx::query(statement.sql());
        for param in statement.params() {
            query = match param {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Int(v) => query.bind(*v),
                SqlValue::Text(s) => query.bind(s.clone()),
            };
        }

        if statement.is_read_only() {
            let rows = query.fetch_all(&mut *conn).await.map_err(|e| {
                Error::QueryExecution(format!("Failed to run '{}': {}", preview(statement.sql()), e))
            })?;
            Ok(QueryResult::from_rows(rows.iter().map(convert_row).collect()))
        } else {
            let done = query.execute(&mut *conn).await.map_err(|e| {
                Error::QueryExecution(format!("Failed to run '{}': {}", preview(statement.sql()), e))
            })?;
            Ok(QueryResult::affected(
                done.rows_affected(),
                Some(done.last_insert_id() as i64),
            ))
        }
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.run_plain("START TRANSACTION").await
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.run_plain("COMMIT").await
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.run_plain("ROLLBACK").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            host: "127.0.0.1".into(),
            port: 1,
            user: "wolfdir".into(),
            password: "secret".into(),
            database: Some("directory".into()),
            connect_timeout_secs: 1,
            ..DatabaseConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unconnected_driver_refuses() {
        let mut driver = MariaDbDriver::new(&config());
        assert!(matches!(driver.ping().await, Err(Error::NotConnected)));
        assert!(matches!(
            driver.execute(&Statement::new("SELECT 1")).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let mut driver = MariaDbDriver::new(&config());
        let err = driver.connect().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_)
        ));
        assert!(!err.to_string().contains("secret"));
    }
}
