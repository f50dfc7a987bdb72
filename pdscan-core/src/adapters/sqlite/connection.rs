//! SQLite connection handling.
//!
//! SQLite is an embedded file, so the adapter holds exactly one connection
//! and shares it between unit-scans. This module turns a configured URL or
//! path into read-only connect options and opens the connection with the
//! same retry policy pooled sources use.
//!
//! # Connection Modes
//! - File-based: `sqlite:///path/to/database.db` or `sqlite://./relative.db`
//! - Bare path: `/path/to/app.db`
//! - In-memory: `sqlite::memory:` or `:memory:`

use crate::Result;
use crate::error::ScanError;
use crate::pool::{PoolConfig, connect_with_retry};
use sqlx::ConnectOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use std::str::FromStr;

/// Builds read-only connect options from a connection string.
///
/// The database file must already exist; it is never created.
///
/// # Errors
/// Returns a configuration error if the string cannot be parsed.
pub fn sqlite_connect_options(connection_string: &str) -> Result<SqliteConnectOptions> {
    let options = if connection_string == ":memory:" {
        SqliteConnectOptions::from_str("sqlite::memory:")
    } else if connection_string.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(connection_string)
    } else {
        Ok(SqliteConnectOptions::new().filename(connection_string))
    }
    .map_err(|e| {
        ScanError::configuration(format!("Invalid SQLite connection string: {}", e))
    })?;

    Ok(options.read_only(true).create_if_missing(false))
}

/// Checks if a connection string names an in-memory database.
pub fn is_in_memory(connection_string: &str) -> bool {
    connection_string.contains(":memory:") || connection_string.contains("mode=memory")
}

/// Opens the connection, retrying with backoff per `policy`.
///
/// # Errors
/// Returns a connection error naming `source` if every attempt fails.
pub async fn open_connection(
    options: &SqliteConnectOptions,
    policy: &PoolConfig,
    source: &str,
) -> Result<SqliteConnection> {
    connect_with_retry(policy, move || async move {
        options.connect().await.map_err(|e| {
            ScanError::connection_failed(format!("Failed to open SQLite database {}", source), e)
        })
    })
    .await
}
