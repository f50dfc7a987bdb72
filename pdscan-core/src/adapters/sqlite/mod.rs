//! SQLite database adapter for data sampling.
//!
//! # Module Structure
//! - `connection`: Read-only connect options and retrying open
//! - `sampling`: Ordering strategy detection and paged sampling
//!
//! # SQLite-Specific Features
//! - Uses `sqlite_master` for table enumeration
//! - Uses PRAGMA commands for ordering detection
//! - One connection shared by all unit-scans; at most
//!   `max_concurrent_tables` units hold it in turn
//!
//! # Security Guarantees
//! - The database is opened read-only and never created
//! - All operations are SELECT/PRAGMA only
//! - No network access required

pub mod connection;
pub mod sampling;

#[cfg(test)]
mod tests;

use super::{AdapterConfig, AdapterFeature, RecordBatchStream, SourceAdapter, UnitFilter};
use crate::Result;
use crate::error::ScanError;
use crate::models::{ConnectionModel, SourceType, Unit, UnitHandle};
use crate::pool::{PoolConfig, SharedConnection};
use async_trait::async_trait;
use sqlx::Connection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use std::sync::Arc;
use tokio::sync::OnceCell;

pub use sampling::{detect_ordering_strategy, generate_order_by_clause};

/// SQLite database adapter.
///
/// The adapter is single-use: once closed it does not reconnect.
pub struct SqliteAdapter {
    config: AdapterConfig,
    options: SqliteConnectOptions,
    shared: OnceCell<Arc<SharedConnection<SqliteConnection>>>,
}

impl std::fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("config", &self.config)
            .field("is_in_memory", &self.is_in_memory())
            .field("connected", &self.shared.initialized())
            .finish_non_exhaustive()
    }
}

impl SqliteAdapter {
    /// Creates an unconnected adapter.
    ///
    /// # Errors
    /// Returns a configuration error if no path is configured or the
    /// connection string cannot be parsed.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| ScanError::configuration("SQLite source requires a path or url"))?;
        let options = connection::sqlite_connect_options(url)?;

        Ok(Self {
            config,
            options,
            shared: OnceCell::new(),
        })
    }

    /// Checks if the connection is to an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.config
            .url
            .as_deref()
            .is_some_and(connection::is_in_memory)
    }

    fn shared(&self) -> Result<Arc<SharedConnection<SqliteConnection>>> {
        self.shared
            .get()
            .cloned()
            .ok_or_else(|| ScanError::configuration("SQLite adapter used before connect"))
    }

    /// Detect the best ordering strategy for sampling a table.
    ///
    /// # Errors
    /// Returns an error if the adapter is not connected or the table
    /// metadata cannot be read.
    pub async fn ordering_for(&self, table: &str) -> Result<crate::models::OrderingStrategy> {
        let shared = self.shared()?;
        let mut conn = shared.lock().await?;
        detect_ordering_strategy(&mut conn, table).await
    }
}

#[async_trait]
impl SourceAdapter for SqliteAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::SQLite
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn connection_model(&self) -> ConnectionModel {
        ConnectionModel::SharedAsync
    }

    fn supports_feature(&self, feature: AdapterFeature) -> bool {
        matches!(
            feature,
            AdapterFeature::DataSampling
                | AdapterFeature::ConcurrentUnits
                | AdapterFeature::ReadOnlyMode
        )
        // Note: SQLite does NOT support:
        // - ConnectionPooling (one shared connection)
        // - SizeHints (COUNT(*) is a full scan)
    }

    async fn connect(&self) -> Result<()> {
        let source = self.source_name();
        let shared = self
            .shared
            .get_or_try_init(|| async {
                let policy = PoolConfig::from_adapter_config(&self.config);
                let conn = connection::open_connection(&self.options, &policy, &source).await?;
                Ok::<_, ScanError>(Arc::new(SharedConnection::new(
                    conn,
                    self.config.max_concurrent_tables as usize,
                )))
            })
            .await?;

        let mut conn = shared.lock().await?;
        let connectivity_result: i32 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ScanError::connection_failed(format!("SQLite {} unusable", source), e))?;

        if connectivity_result != 1 {
            return Err(ScanError::configuration(
                "Basic connectivity test failed: unexpected result",
            ));
        }

        tracing::debug!("Opened SQLite source {}", source);
        Ok(())
    }

    async fn enumerate_units(&self, filter: &UnitFilter) -> Result<Vec<Unit>> {
        let shared = self.shared()?;
        let names: Vec<String> = {
            let mut conn = shared.lock().await?;
            sqlx::query_scalar(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| ScanError::query_failed("Failed to enumerate SQLite tables", e))?
        };

        let units = names.iter().map(|name| Unit::table(None, name)).collect();
        Ok(filter.apply(units))
    }

    async fn sample(&self, unit: &Unit, sample_size: u32) -> Result<RecordBatchStream> {
        let UnitHandle::Table { table, .. } = &unit.handle else {
            return Err(ScanError::unit_scan(&unit.name, "not a SQLite table"));
        };

        let shared = self.shared()?;
        let slot = shared.unit_slot().await?;
        let strategy = {
            let mut conn = shared.lock().await?;
            detect_ordering_strategy(&mut conn, table).await?
        };

        Ok(sampling::page_stream(
            shared,
            slot,
            table.clone(),
            &strategy,
            sample_size,
            self.config.fetch_size,
        ))
    }

    async fn close(&self) -> Result<()> {
        if let Some(shared) = self.shared.get()
            && let Some(conn) = shared.take().await
        {
            conn.close()
                .await
                .map_err(|e| ScanError::connection_failed("Failed to close SQLite connection", e))?;
            tracing::debug!("Closed SQLite source {}", self.source_name());
        }
        Ok(())
    }
}
