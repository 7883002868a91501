//! Directory Tables
//!
//! Table definitions accepted by both MariaDB and SQLite. Creating them is
//! a write, so it only happens on a leader.

use crate::error::Result;
use crate::store::{Statement, StoreDriver};

const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS dir_subject (
        uin BIGINT NOT NULL PRIMARY KEY,
        logon_id VARCHAR(255) NOT NULL,
        logon_key VARCHAR(255) NOT NULL UNIQUE,
        credential VARCHAR(255) NOT NULL,
        first_name VARCHAR(255) NOT NULL DEFAULT '',
        last_name VARCHAR(255) NOT NULL DEFAULT '',
        email VARCHAR(255) NOT NULL DEFAULT '',
        language VARCHAR(16) NOT NULL DEFAULT 'en',
        valid_until BIGINT NULL,
        created BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dir_session (
        session_id VARCHAR(64) NOT NULL PRIMARY KEY,
        session_key VARCHAR(64) NOT NULL,
        uin BIGINT NOT NULL,
        last_access BIGINT NOT NULL,
        created BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS dir_session_history (
        session_id VARCHAR(64) NOT NULL,
        uin BIGINT NOT NULL,
        created BIGINT NOT NULL,
        last_access BIGINT NOT NULL,
        ended BIGINT NOT NULL
    )",
];

/// Create any missing directory tables
pub async fn ensure_schema<D: StoreDriver + ?Sized>(driver: &mut D) -> Result<()> {
    for ddl in TABLES {
        driver.execute(&Statement::new(*ddl)).await?;
    }
    tracing::info!("Directory schema is up to date");
    Ok(())
}
