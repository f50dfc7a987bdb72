//! MongoDB database adapter for document sampling.
//!
//! # Module Structure
//! - `connection`: Client options, pool sizing and connection validation
//! - `enumeration`: Database and collection enumeration
//! - `sampling`: Document sampling and BSON flattening
//!
//! # Connection model
//! The driver owns the connection pool. `pool_min`/`pool_max` size it, and
//! concurrent unit-scans share one [`Client`].
//!
//! # Security Guarantees
//! - All operations are read-only
//! - Connection strings are sanitized in error messages
//! - Query timeouts prevent resource exhaustion

pub mod connection;
pub mod enumeration;
pub mod sampling;


use super::{AdapterConfig, AdapterFeature, RecordBatchStream, SourceAdapter, UnitFilter};
use crate::Result;
use crate::error::ScanError;
use crate::models::{ConnectionModel, SourceType, Unit, UnitHandle};
use async_trait::async_trait;
use mongodb::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;

pub use sampling::document_to_record;

/// MongoDB database adapter.
pub struct MongoAdapter {
    config: AdapterConfig,
    client: OnceCell<Client>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MongoAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoAdapter")
            .field("config", &self.config)
            .field("connected", &self.client.initialized())
            // Note: the client is omitted, its options carry credentials
            .finish_non_exhaustive()
    }
}

impl MongoAdapter {
    /// Creates an unconnected adapter.
    ///
    /// # Errors
    /// Returns a configuration error for a malformed connection string.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        connection::validate_connection_string(&connection::connection_string(&config))?;
        Ok(Self {
            config,
            client: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn client(&self) -> Result<&Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ScanError::connection_failed(
                "MongoDB client",
                std::io::Error::other("client is closed"),
            ));
        }
        self.client
            .get()
            .ok_or_else(|| ScanError::configuration("MongoDB adapter used before connect"))
    }
}

#[async_trait]
impl SourceAdapter for MongoAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::MongoDB
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
        )
    }

    async fn connect(&self) -> Result<()> {
        self.client
            .get_or_try_init(|| connection::connect_client(&self.config))
            .await?;
        tracing::debug!("Connected to MongoDB {}", self.source_name());
        Ok(())
    }

    async fn enumerate_units(&self, filter: &UnitFilter) -> Result<Vec<Unit>> {
        let client = self.client()?;
        let databases =
            enumeration::list_databases(client, self.config.database.as_deref()).await?;

        let mut units = Vec::new();
        for database in &databases {
            units.extend(enumeration::list_collections(client, database).await?);
        }
        Ok(filter.apply(units))
    }

    async fn sample(&self, unit: &Unit, sample_size: u32) -> Result<RecordBatchStream> {
        let UnitHandle::Collection {
            database,
            collection,
        } = &unit.handle
        else {
            return Err(ScanError::unit_scan(&unit.name, "not a MongoDB collection"));
        };

        sampling::sample_collection(
            self.client()?,
            database,
            collection,
            sample_size,
            self.config.fetch_size,
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(client) = self.client.get() {
            client.clone().shutdown().await;
            tracing::debug!("Closed MongoDB client for {}", self.source_name());
        }
        Ok(())
    }
}
