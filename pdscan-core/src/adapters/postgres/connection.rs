//! PostgreSQL connection options and pooled connection management.
//!
//! # Security Features
//! - Validates connection string format and parameters
//! - Every new connection is made read-only with a statement timeout
//! - Credentials are passed from zeroizing storage and never logged
//! - Connection strings are redacted in all error messages

use crate::Result;
use crate::adapters::AdapterConfig;
use crate::error::ScanError;
use crate::pool::ConnectionManager;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection, Executor};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// PostgreSQL default port
pub const DEFAULT_PORT: u16 = 5432;

/// Opens PostgreSQL connections for a [`crate::pool::ConnectionPool`].
pub struct PgConnectionManager {
    options: PgConnectOptions,
    statement_timeout: Duration,
    source: String,
}

impl std::fmt::Debug for PgConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnectionManager")
            .field("source", &self.source)
            .field("statement_timeout", &self.statement_timeout)
            // Note: connect options carry the password and are omitted
            .finish_non_exhaustive()
    }
}

impl PgConnectionManager {
    /// # Errors
    /// Returns a configuration error if the connection settings are invalid.
    pub fn new(config: &AdapterConfig) -> Result<Self> {
        Ok(Self {
            options: pg_connect_options(config)?,
            statement_timeout: config.timeout(),
            source: config.source_name(),
        })
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl ConnectionManager for PgConnectionManager {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        let mut conn = self.options.connect().await.map_err(|e| {
            ScanError::connection_failed(
                format!("Failed to connect to PostgreSQL {}", self.source),
                e,
            )
        })?;

        apply_session_settings(&mut conn, self.statement_timeout)
            .await
            .map_err(|e| {
                ScanError::connection_failed(
                    format!("Failed to configure session on {}", self.source),
                    e,
                )
            })?;

        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut PgConnection) -> bool {
        matches!(
            sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(conn).await,
            Ok(1)
        )
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            tracing::debug!("Error closing PostgreSQL connection: {}", e);
        }
    }
}

/// Applies session security settings to a fresh connection.
///
/// - Query timeout to prevent long-running queries
/// - Read-only mode to prevent accidental writes
/// - Lock timeout to prevent blocking operations
/// - Application name for connection tracking
/// - UTC timezone for consistent timestamps
async fn apply_session_settings(
    conn: &mut PgConnection,
    statement_timeout: Duration,
) -> std::result::Result<(), sqlx::Error> {
    conn.execute(
        format!(
            "SET statement_timeout = '{}ms'",
            statement_timeout.as_millis()
        )
        .as_str(),
    )
    .await?;
    conn.execute("SET lock_timeout = '30s'").await?;
    conn.execute("SET idle_in_transaction_session_timeout = '60s'")
        .await?;
    conn.execute("SET default_transaction_read_only = on").await?;
    conn.execute("SET timezone = 'UTC'").await?;
    Ok(())
}

/// Builds connect options from a URL or from discrete host settings.
///
/// Discrete `user`/`password`/`database` settings override the URL's.
///
/// # Errors
/// Returns a configuration error if the URL is malformed or not PostgreSQL.
pub fn pg_connect_options(config: &AdapterConfig) -> Result<PgConnectOptions> {
    let mut options = match config.url.as_deref() {
        Some(url) => {
            validate_connection_string(url)?;
            PgConnectOptions::from_str(url).map_err(|e| {
                ScanError::configuration(format!(
                    "Invalid PostgreSQL connection string format: {}",
                    e
                ))
            })?
        }
        None => PgConnectOptions::new_without_pgpass()
            .host(config.host.as_deref().unwrap_or("localhost"))
            .port(config.port.unwrap_or(DEFAULT_PORT)),
    };

    if let Some(credentials) = config.credentials() {
        options = options.username(credentials.username());
        if let Some(password) = credentials.password() {
            options = options.password(password);
        }
    }
    if let Some(database) = config.database.as_deref() {
        options = options.database(database);
    }
    if config.ssl {
        options = options.ssl_mode(PgSslMode::Require);
    }

    let app_name = format!("pdscan-{}", env!("CARGO_PKG_VERSION"));
    Ok(options.application_name(&app_name))
}

/// Validates connection string format and security requirements.
///
/// # Errors
/// Returns error if connection string is invalid or unsafe
pub fn validate_connection_string(connection_string: &str) -> Result<()> {
    let url = Url::parse(connection_string).map_err(|e| {
        ScanError::configuration(format!(
            "Invalid PostgreSQL connection string format: {}",
            e
        ))
    })?;

    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(ScanError::configuration(
            "Connection string must use postgres:// or postgresql:// scheme",
        ));
    }

    if url.host_str().is_none() {
        return Err(ScanError::configuration(
            "Connection string must specify a host",
        ));
    }

    if url.port() == Some(0) {
        return Err(ScanError::configuration(
            "Invalid port number: must be greater than 0",
        ));
    }

    Ok(())
}
