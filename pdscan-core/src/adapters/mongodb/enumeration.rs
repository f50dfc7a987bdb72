//! MongoDB database and collection enumeration.
//!
//! # Security
//! - All operations are read-only
//! - System databases and `system.*` collections are skipped

use crate::Result;
use crate::error::ScanError;
use crate::models::Unit;
use mongodb::Client;
use mongodb::bson::Document;

/// System databases that are never scanned.
pub const SYSTEM_DATABASES: &[&str] = &["admin", "config", "local"];

/// Checks if this database is a known system database.
pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES.contains(&name)
}

/// Checks if a collection is internal to MongoDB.
pub fn is_system_collection(name: &str) -> bool {
    name.starts_with("system.")
}

/// Lists the databases to scan: the configured one, or every non-system one.
///
/// # Errors
/// Returns a query error if the server refuses to list databases.
pub async fn list_databases(client: &Client, configured: Option<&str>) -> Result<Vec<String>> {
    if let Some(database) = configured {
        return Ok(vec![database.to_string()]);
    }

    let mut names = client
        .list_database_names()
        .await
        .map_err(|e| ScanError::query_failed("Failed to enumerate databases", e))?;
    names.retain(|name| !is_system_database(name));
    names.sort();
    Ok(names)
}

/// Lists the collections of `database` as units with document estimates.
///
/// # Errors
/// Returns a query error if the collections cannot be listed.
pub async fn list_collections(client: &Client, database: &str) -> Result<Vec<Unit>> {
    let db = client.database(database);
    let names = db.list_collection_names().await.map_err(|e| {
        ScanError::query_failed(
            format!("Failed to list collections in database '{}'", database),
            e,
        )
    })?;

    let mut units = Vec::with_capacity(names.len());
    for name in names {
        if is_system_collection(&name) {
            tracing::trace!("Skipping system collection: {}", name);
            continue;
        }

        let unit = Unit::collection(database, &name);
        // Views reject count commands; they are still sampled
        let estimate = db
            .collection::<Document>(&name)
            .estimated_document_count()
            .await
            .ok();
        units.push(match estimate {
            Some(count) => unit.with_size_hint(count),
            None => unit,
        });
    }

    tracing::debug!(
        "Listed {} collections in database '{}'",
        units.len(),
        database
    );
    Ok(units)
}
