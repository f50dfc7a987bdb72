//! PostgreSQL data sampling utilities.
//!
//! Rows are fetched as `row_to_json` objects in pages, so every column type
//! arrives as JSON text and nested `json`/`jsonb` values flatten into dot
//! paths like document fields do.
//!
//! # Ordering Strategy Detection
//!
//! The detection priority is:
//! 1. Primary key columns (most reliable for consistent ordering)
//! 2. Timestamp columns (created_at, updated_at, etc.)
//! 3. Physical row location (`ctid`)
//!
//! # Security
//! - All queries are read-only
//! - Identifiers are quoted and values bound as parameters

use crate::Result;
use crate::adapters::RecordBatchStream;
use crate::error::ScanError;
use crate::models::{OrderingStrategy, SampledRecord, SortDirection};
use crate::pool::PooledConnection;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use sqlx::Row;
use sqlx::postgres::PgConnection;

use super::connection::PgConnectionManager;

/// Common timestamp column names used for ordering by "most recent"
const TIMESTAMP_COLUMN_NAMES: &[&str] = &[
    "created_at",
    "updated_at",
    "modified_at",
    "inserted_at",
    "timestamp",
    "created",
    "updated",
    "modified",
    "date_created",
    "date_updated",
    "date_modified",
    "creation_time",
    "modification_time",
    "update_time",
    "create_time",
];

/// Double-quotes an identifier for PostgreSQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Detect the best ordering strategy for a table.
///
/// # Errors
/// Returns a query error if the catalogs cannot be read.
pub async fn detect_ordering_strategy(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
) -> Result<OrderingStrategy> {
    let pk_query = r#"
        SELECT a.attname AS column_name
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
        WHERE i.indisprimary = true
        AND c.relname = $1
        AND n.nspname = $2
        ORDER BY array_position(i.indkey, a.attnum)
    "#;

    let columns: Vec<String> = sqlx::query_scalar(pk_query)
        .bind(table)
        .bind(schema)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            ScanError::query_failed(
                format!("Failed to detect primary key for table '{}.{}'", schema, table),
                e,
            )
        })?;

    if !columns.is_empty() {
        return Ok(OrderingStrategy::PrimaryKey { columns });
    }

    let ts_query = r#"
        SELECT column_name
        FROM information_schema.columns
        WHERE table_schema = $1
        AND table_name = $2
        AND data_type IN ('timestamp without time zone', 'timestamp with time zone', 'date')
        ORDER BY ordinal_position
    "#;

    let rows = sqlx::query(ts_query)
        .bind(schema)
        .bind(table)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            ScanError::query_failed(
                format!(
                    "Failed to detect timestamp columns for table '{}.{}'",
                    schema, table
                ),
                e,
            )
        })?;
    let timestamp_columns: Vec<String> = rows
        .iter()
        .filter_map(|row| row.try_get("column_name").ok())
        .collect();

    if let Some(column) = pick_timestamp_column(&timestamp_columns) {
        return Ok(OrderingStrategy::Timestamp {
            column: column.to_string(),
            direction: SortDirection::Descending,
        });
    }

    tracing::debug!(
        "No key or timestamp on {}.{}, ordering by ctid",
        schema,
        table
    );
    Ok(OrderingStrategy::SystemRowId {
        column: "ctid".to_string(),
    })
}

/// Chooses an exact well-known timestamp name, then a partial match.
pub fn pick_timestamp_column(columns: &[String]) -> Option<&str> {
    let exact = columns
        .iter()
        .find(|c| TIMESTAMP_COLUMN_NAMES.contains(&c.to_lowercase().as_str()));
    let partial = || {
        columns.iter().find(|c| {
            let lower = c.to_lowercase();
            lower.contains("created") || lower.contains("inserted") || lower.contains("timestamp")
        })
    };
    exact.or_else(partial).map(String::as_str)
}

/// Generate an ORDER BY clause for the given ordering strategy.
pub fn generate_order_by_clause(strategy: &OrderingStrategy, descending: bool) -> String {
    let direction = if descending { "DESC" } else { "ASC" };

    match strategy {
        OrderingStrategy::PrimaryKey { columns } => {
            let cols: Vec<String> = columns
                .iter()
                .map(|c| format!("{} {}", quote_identifier(c), direction))
                .collect();
            format!("ORDER BY {}", cols.join(", "))
        }
        OrderingStrategy::Timestamp { column, direction } => {
            let direction = match direction {
                SortDirection::Ascending => "ASC",
                SortDirection::Descending => "DESC",
            };
            format!(
                "ORDER BY {} {} NULLS LAST, ctid",
                quote_identifier(column),
                direction
            )
        }
        OrderingStrategy::SystemRowId { column } => {
            format!("ORDER BY {} {}", column, direction)
        }
        OrderingStrategy::Unordered => String::new(),
    }
}

/// Builds the page query for a table. Binds: `$1` limit, `$2` offset.
pub fn page_query(schema: &str, table: &str, strategy: &OrderingStrategy) -> String {
    format!(
        "SELECT row_to_json(t.*) AS row_data FROM {}.{} t {} LIMIT $1 OFFSET $2",
        quote_identifier(schema),
        quote_identifier(table),
        generate_order_by_clause(strategy, true)
    )
}

struct PageState {
    conn: PooledConnection<PgConnectionManager>,
    unit: String,
    query: String,
    offset: u32,
    remaining: u32,
    fetch_size: u32,
}

/// Streams up to `sample_size` rows in pages of `fetch_size`.
///
/// The pooled connection stays checked out until the stream is dropped.
pub fn page_stream(
    conn: PooledConnection<PgConnectionManager>,
    unit: String,
    query: String,
    sample_size: u32,
    fetch_size: u32,
) -> RecordBatchStream {
    let state = PageState {
        conn,
        unit,
        query,
        offset: 0,
        remaining: sample_size,
        fetch_size: fetch_size.max(1),
    };

    futures::stream::try_unfold(state, |mut state| async move {
        if state.remaining == 0 {
            return Ok(None);
        }
        let limit = state.remaining.min(state.fetch_size);

        let rows: Vec<JsonValue> = sqlx::query_scalar(&state.query)
            .bind(i64::from(limit))
            .bind(i64::from(state.offset))
            .fetch_all(&mut *state.conn)
            .await
            .map_err(|e| {
                ScanError::query_failed(format!("Failed to sample table '{}'", state.unit), e)
            })?;

        let fetched = u32::try_from(rows.len()).unwrap_or(u32::MAX);
        if fetched == 0 {
            return Ok(None);
        }
        state.offset = state.offset.saturating_add(fetched);
        state.remaining = if fetched < limit {
            0
        } else {
            state.remaining.saturating_sub(fetched)
        };

        let batch: Vec<SampledRecord> = rows.iter().filter_map(json_to_record).collect();
        Ok::<_, ScanError>(Some((batch, state)))
    })
    .boxed()
}

/// Flattens one `row_to_json` object. Non-objects are skipped.
pub fn json_to_record(value: &JsonValue) -> Option<SampledRecord> {
    value.as_object().map(SampledRecord::from_json_object)
}
