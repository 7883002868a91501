//! Embedded SQLite Driver
//!
//! Runs the directory against a local SQLite database. Named in-memory
//! databases use SQLite's shared cache, so every worker connection opened
//! with the same name sees the same tables, as they would on a server.

use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{Connection, OpenFlags, ToSql};

use super::{QueryResult, Row, SqlValue, Statement, StoreDriver};
use crate::error::{Error, Result};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// SQLite-backed store driver
pub struct SqliteDriver {
    /// File path or shared-memory URI
    location: String,
    conn: Option<Connection>,
}

impl SqliteDriver {
    /// Driver for a database file
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            location: path.into(),
            conn: None,
        }
    }

    /// Driver for a named in-memory database shared by every driver with
    /// the same name in this process
    pub fn memory(name: &str) -> Self {
        Self::new(format!("file:wolfdir-{}?mode=memory&cache=shared", name))
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(Error::NotConnected)
    }

    fn open(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.location, flags)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }
}

fn convert(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Int(v),
        ValueRef::Real(v) => SqlValue::Int(v as i64),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

#[async_trait::async_trait]
impl StoreDriver for SqliteDriver {
    async fn connect(&mut self) -> Result<()> {
        // Open the replacement first so a shared in-memory database is never
        // left without a connection.
        let conn = self.open()?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        let one: i64 = self.conn()?.query_row("SELECT 1", [], |row| row.get(0))?;
        if one != 1 {
            return Err(Error::QueryExecution("ping returned unexpected value".into()));
        }
        Ok(())
    }

    async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.conn()?.prepare_cached(sql)?;
        Ok(Statement::new(sql))
    }

    async fn execute(&mut self, statement: &Statement) -> Result<QueryResult> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statement.sql())?;
        let params = rusqlite::params_from_iter(statement.params().iter());

        let column_count = stmt.column_count();
        if column_count > 0 {
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(column_count);
                for idx in 0..column_count {
                    values.push(convert(row.get_ref(idx)?));
                }
                out.push(Row::new(values));
            }
            Ok(QueryResult::from_rows(out))
        } else {
            let affected = stmt.execute(params)?;
            Ok(QueryResult::affected(
                affected as u64,
                Some(conn.last_insert_rowid()),
            ))
        }
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.conn()?.execute_batch("BEGIN")?;
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        self.conn()?.execute_batch("COMMIT")?;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.conn()?.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
