//! PostgreSQL table enumeration.
//!
//! Lists base tables outside the system schemas with the planner's row
//! estimate as a size hint.
//!
//! # Security
//! - All operations are read-only
//! - Only catalog views are queried

use crate::Result;
use crate::error::ScanError;
use crate::models::Unit;
use sqlx::Row;
use sqlx::postgres::PgConnection;

/// Schemas never scanned.
pub const SYSTEM_SCHEMAS: &[&str] = &["pg_catalog", "information_schema"];

const TABLES_QUERY: &str = r#"
    SELECT t.table_schema, t.table_name, c.reltuples::bigint AS estimated_rows
    FROM information_schema.tables t
    LEFT JOIN pg_catalog.pg_namespace n ON n.nspname = t.table_schema
    LEFT JOIN pg_catalog.pg_class c ON c.relnamespace = n.oid AND c.relname = t.table_name
    WHERE t.table_type = 'BASE TABLE'
    AND t.table_schema <> ALL($1)
    AND t.table_schema NOT LIKE 'pg_toast%'
    AND t.table_schema NOT LIKE 'pg_temp%'
    ORDER BY t.table_schema, t.table_name
"#;

/// Checks if a schema is a PostgreSQL system schema.
pub fn is_system_schema(schema: &str) -> bool {
    SYSTEM_SCHEMAS.contains(&schema) || schema.starts_with("pg_toast") || schema.starts_with("pg_temp")
}

/// Lists user tables as `schema.table` units.
///
/// # Errors
/// Returns a query error if the catalogs cannot be read.
pub async fn list_tables(conn: &mut PgConnection) -> Result<Vec<Unit>> {
    let system: Vec<String> = SYSTEM_SCHEMAS.iter().map(|s| (*s).to_string()).collect();
    let rows = sqlx::query(TABLES_QUERY)
        .bind(system)
        .fetch_all(conn)
        .await
        .map_err(|e| ScanError::query_failed("Failed to enumerate PostgreSQL tables", e))?;

    let mut units = Vec::with_capacity(rows.len());
    for row in &rows {
        let schema: String = row
            .try_get("table_schema")
            .map_err(|e| ScanError::query_failed("Failed to read table_schema", e))?;
        let table: String = row
            .try_get("table_name")
            .map_err(|e| ScanError::query_failed("Failed to read table_name", e))?;
        let estimate: Option<i64> = row.try_get("estimated_rows").unwrap_or(None);

        let unit = Unit::table(Some(&schema), &table);
        // reltuples is -1 until the table has been analyzed
        units.push(match estimate.and_then(|n| u64::try_from(n).ok()) {
            Some(rows) => unit.with_size_hint(rows),
            None => unit,
        });
    }

    tracing::debug!("Enumerated {} PostgreSQL tables", units.len());
    Ok(units)
}
