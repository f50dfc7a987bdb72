//! PostgreSQL database adapter for data sampling.
//!
//! # Module Structure
//! - `connection`: Connect options, session settings and the pool manager
//! - `enumeration`: Table listing with row estimates
//! - `sampling`: Ordering strategy detection and paged sampling
//!
//! # Connection model
//! Connections come from a bounded [`ConnectionPool`]. Each unit-scan checks
//! one out for the life of its record stream, so `pool_max` bounds how many
//! tables are sampled at once.
//!
//! # Security Guarantees
//! - Every session is read-only with a statement timeout
//! - Credentials are never logged or exposed in error messages
//! - Connection strings are sanitized in all outputs

pub mod connection;
pub mod enumeration;
pub mod sampling;

#[cfg(test)]
mod tests;

use super::{AdapterConfig, AdapterFeature, RecordBatchStream, SourceAdapter, UnitFilter};
use crate::Result;
use crate::error::ScanError;
use crate::models::{ConnectionModel, SourceType, Unit, UnitHandle};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use async_trait::async_trait;

pub use connection::PgConnectionManager;
pub use sampling::{detect_ordering_strategy, generate_order_by_clause};

/// PostgreSQL database adapter with connection pooling
pub struct PostgresAdapter {
    config: AdapterConfig,
    pool: ConnectionPool<PgConnectionManager>,
}

impl std::fmt::Debug for PostgresAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresAdapter")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish()
    }
}

impl PostgresAdapter {
    /// Creates an adapter with an empty pool. Nothing connects until
    /// [`SourceAdapter::connect`].
    ///
    /// # Errors
    /// Returns a configuration error for invalid connection or pool settings.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        let manager = PgConnectionManager::new(&config)?;
        let pool = ConnectionPool::new(manager, PoolConfig::from_adapter_config(&config))?;
        Ok(Self { config, pool })
    }

    /// Gets detailed connection pool statistics for monitoring
    pub fn pool_statistics(&self) -> PoolStats {
        self.pool.statistics()
    }

    /// Checks the health of the connection pool
    pub async fn is_pool_healthy(&self) -> bool {
        match self.pool.acquire().await {
            Ok(mut conn) => matches!(
                sqlx::query_scalar::<_, i32>("SELECT 1")
                    .fetch_one(&mut *conn)
                    .await,
                Ok(1)
            ),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl SourceAdapter for PostgresAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::PostgreSQL
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn connection_model(&self) -> ConnectionModel {
        ConnectionModel::Pooled
    }

    fn supports_feature(&self, feature: AdapterFeature) -> bool {
        matches!(
            feature,
            AdapterFeature::DataSampling
                | AdapterFeature::ConnectionPooling
                | AdapterFeature::ConcurrentUnits
                | AdapterFeature::SizeHints
                | AdapterFeature::NestedDocuments
                | AdapterFeature::ReadOnlyMode
        )
    }

    async fn connect(&self) -> Result<()> {
        self.pool.warm_up().await?;
        if !self.is_pool_healthy().await {
            return Err(ScanError::connection_failed(
                format!("PostgreSQL {} failed its health check", self.source_name()),
                std::io::Error::other("SELECT 1 failed"),
            ));
        }
        tracing::debug!(
            "Connected to PostgreSQL {} ({:?})",
            self.source_name(),
            self.pool.statistics()
        );
        Ok(())
    }

    async fn enumerate_units(&self, filter: &UnitFilter) -> Result<Vec<Unit>> {
        let mut conn = self.pool.acquire().await?;
        let units = enumeration::list_tables(&mut conn).await?;
        Ok(filter.apply(units))
    }

    async fn sample(&self, unit: &Unit, sample_size: u32) -> Result<RecordBatchStream> {
        let UnitHandle::Table {
            schema: Some(schema),
            table,
        } = &unit.handle
        else {
            return Err(ScanError::unit_scan(
                &unit.name,
                "not a schema-qualified PostgreSQL table",
            ));
        };

        let mut conn = self.pool.acquire().await?;
        let strategy = detect_ordering_strategy(&mut conn, schema, table).await?;
        let query = sampling::page_query(schema, table, &strategy);
        tracing::debug!("Sampling {} with {:?}", unit.name, strategy);

        Ok(sampling::page_stream(
            conn,
            unit.name.clone(),
            query,
            sample_size,
            self.config.fetch_size,
        ))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
