//! MongoDB client options and connection validation.
//!
//! The driver keeps its own connection pool; this module sizes it from the
//! adapter config and validates connectivity with a `ping`.
//!
//! # Security Features
//! - Connection string credentials are never logged
//! - Connection validation without side effects
//! - Timeout configuration for all operations

use crate::Result;
use crate::adapters::AdapterConfig;
use crate::error::ScanError;
use crate::pool::{PoolConfig, connect_with_retry};
use mongodb::Client;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, Credential};
use url::Url;

/// MongoDB default port
pub const DEFAULT_PORT: u16 = 27017;

/// Validates a MongoDB connection string.
///
/// # Errors
/// Returns error if connection string is invalid or unsafe
pub fn validate_connection_string(connection_string: &str) -> Result<()> {
    let url = Url::parse(connection_string).map_err(|e| {
        ScanError::configuration(format!("Invalid MongoDB connection string format: {}", e))
    })?;

    if !matches!(url.scheme(), "mongodb" | "mongodb+srv") {
        return Err(ScanError::configuration(
            "Connection string must use mongodb:// or mongodb+srv:// scheme",
        ));
    }

    if url.host_str().is_none() {
        return Err(ScanError::configuration(
            "Connection string must specify a host",
        ));
    }

    Ok(())
}

/// Connection string for `config`, built from host settings when no URL
/// is configured.
pub fn connection_string(config: &AdapterConfig) -> String {
    match config.url.as_deref() {
        Some(url) => url.to_string(),
        None => format!(
            "mongodb://{}:{}",
            config.host.as_deref().unwrap_or("localhost"),
            config.port.unwrap_or(DEFAULT_PORT)
        ),
    }
}

/// Creates client options with pool bounds and timeouts from `config`.
///
/// # Errors
/// Returns a configuration error if the connection string cannot be parsed.
pub async fn client_options(config: &AdapterConfig) -> Result<ClientOptions> {
    let url = connection_string(config);
    validate_connection_string(&url)?;

    let mut options = ClientOptions::parse(&url).await.map_err(|e| {
        ScanError::configuration(format!(
            "Failed to parse MongoDB connection options for {}: {}",
            config.source_name(),
            e
        ))
    })?;

    options.connect_timeout = Some(config.timeout());
    options.server_selection_timeout = Some(config.timeout());
    options.max_pool_size = Some(config.pool_max());
    options.min_pool_size = Some(config.pool_min);
    options.app_name = Some(format!("pdscan-{}", env!("CARGO_PKG_VERSION")));

    if let Some(credentials) = config.credentials() {
        options.credential = Some(
            Credential::builder()
                .username(credentials.username().to_string())
                .password(credentials.password().map(str::to_string))
                .build(),
        );
    }

    Ok(options)
}

/// Builds a client and pings the server, retrying per the adapter policy.
///
/// # Errors
/// Returns a connection error if the server cannot be reached.
pub async fn connect_client(config: &AdapterConfig) -> Result<Client> {
    let options = client_options(config).await?;
    let client = Client::with_options(options).map_err(|e| {
        ScanError::connection_failed(
            format!("Failed to create MongoDB client for {}", config.source_name()),
            e,
        )
    })?;

    let policy = PoolConfig::from_adapter_config(config);
    let source = config.source_name();
    let ping_client = client.clone();
    connect_with_retry(&policy, move || {
        let client = ping_client.clone();
        let source = source.clone();
        async move {
            client
                .database("admin")
                .run_command(doc! { "ping": 1 })
                .await
                .map(|_| ())
                .map_err(|e| {
                    ScanError::connection_failed(format!("Failed to reach MongoDB {}", source), e)
                })
        }
    })
    .await?;

    Ok(client)
}
