//! SQLite data sampling.
//!
//! Sampling pages through a table with `LIMIT`/`OFFSET`, so the order must be
//! stable between pages. The detection priority is:
//! 1. Primary key columns
//! 2. Timestamp columns (created_at, updated_at, etc.)
//! 3. ROWID
//! 4. Unordered (scan order, no ORDER BY)

use crate::Result;
use crate::adapters::RecordBatchStream;
use crate::error::ScanError;
use crate::models::{OrderingStrategy, SampledRecord, SortDirection};
use crate::pool::SharedConnection;
use futures::StreamExt;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

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

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    /// Position in the primary key, 0 when not part of it
    pub pk: i32,
}

/// Double-quotes an identifier for SQLite.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Detect the best ordering strategy for a SQLite table.
///
/// # Errors
/// Returns a query error if the table metadata cannot be read.
pub async fn detect_ordering_strategy(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<OrderingStrategy> {
    let pragma = format!("PRAGMA table_info('{}')", table.replace('\'', "''"));
    let rows = sqlx::query(&pragma)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| {
            ScanError::query_failed(format!("Failed to read columns of table '{}'", table), e)
        })?;

    let columns: Vec<ColumnInfo> = rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.try_get("name").unwrap_or_default(),
            data_type: row.try_get("type").unwrap_or_default(),
            pk: row.try_get("pk").unwrap_or(0),
        })
        .collect();

    if let Some(strategy) = ordering_from_columns(&columns) {
        tracing::debug!("Detected ordering for {}: {:?}", table, strategy);
        return Ok(strategy);
    }

    // WITHOUT ROWID tables always have a primary key, so this rarely fails.
    let probe = format!("SELECT rowid FROM {} LIMIT 1", quote_identifier(table));
    if sqlx::query(&probe).fetch_optional(&mut *conn).await.is_ok() {
        return Ok(OrderingStrategy::SystemRowId {
            column: "rowid".to_string(),
        });
    }

    tracing::debug!(
        "No reliable ordering found for {}, using scan order",
        table
    );
    Ok(OrderingStrategy::Unordered)
}

/// Picks a primary key or timestamp ordering from column metadata.
pub fn ordering_from_columns(columns: &[ColumnInfo]) -> Option<OrderingStrategy> {
    let mut pk_columns: Vec<&ColumnInfo> = columns.iter().filter(|c| c.pk > 0).collect();
    if !pk_columns.is_empty() {
        pk_columns.sort_by_key(|c| c.pk);
        return Some(OrderingStrategy::PrimaryKey {
            columns: pk_columns.into_iter().map(|c| c.name.clone()).collect(),
        });
    }

    let timestamp_columns: Vec<&ColumnInfo> = columns
        .iter()
        .filter(|c| {
            let upper = c.data_type.to_uppercase();
            upper.contains("DATE") || upper.contains("TIME")
        })
        .collect();

    let exact = timestamp_columns.iter().find(|c| {
        let lower = c.name.to_lowercase();
        TIMESTAMP_COLUMN_NAMES.contains(&lower.as_str())
    });
    let partial = || {
        timestamp_columns.iter().find(|c| {
            let lower = c.name.to_lowercase();
            lower.contains("created") || lower.contains("inserted") || lower.contains("timestamp")
        })
    };

    exact.or_else(partial).map(|c| OrderingStrategy::Timestamp {
        column: c.name.clone(),
        direction: SortDirection::Descending,
    })
}

/// Generate an ORDER BY clause for the given ordering strategy (SQLite syntax).
///
/// Timestamp orderings use their own direction. Unordered tables get an empty
/// clause: `RANDOM()` would reshuffle between pages.
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
            format!("ORDER BY {} {}, rowid", quote_identifier(column), direction)
        }
        OrderingStrategy::SystemRowId { column } => {
            format!("ORDER BY {} {}", column, direction)
        }
        OrderingStrategy::Unordered => String::new(),
    }
}

/// Builds the page query for a table. Binds: limit, offset.
pub fn page_query(table: &str, strategy: &OrderingStrategy) -> String {
    let order_by = generate_order_by_clause(strategy, true);
    if order_by.is_empty() {
        format!("SELECT * FROM {} LIMIT ? OFFSET ?", quote_identifier(table))
    } else {
        format!(
            "SELECT * FROM {} {} LIMIT ? OFFSET ?",
            quote_identifier(table),
            order_by
        )
    }
}

struct PageState {
    shared: Arc<SharedConnection<SqliteConnection>>,
    _slot: OwnedSemaphorePermit,
    table: String,
    query: String,
    offset: u32,
    remaining: u32,
    fetch_size: u32,
}

/// Streams up to `sample_size` rows of `table` in pages of `fetch_size`.
///
/// The unit slot is held until the stream is dropped. The connection lock
/// is taken once per page.
pub fn page_stream(
    shared: Arc<SharedConnection<SqliteConnection>>,
    slot: OwnedSemaphorePermit,
    table: String,
    strategy: &OrderingStrategy,
    sample_size: u32,
    fetch_size: u32,
) -> RecordBatchStream {
    let state = PageState {
        shared,
        _slot: slot,
        query: page_query(&table, strategy),
        table,
        offset: 0,
        remaining: sample_size,
        fetch_size: fetch_size.max(1),
    };

    futures::stream::try_unfold(state, |mut state| async move {
        if state.remaining == 0 {
            return Ok(None);
        }
        let limit = state.remaining.min(state.fetch_size);

        let rows = {
            let mut conn = state.shared.lock().await?;
            sqlx::query(&state.query)
                .bind(i64::from(limit))
                .bind(i64::from(state.offset))
                .fetch_all(&mut *conn)
                .await
                .map_err(|e| {
                    ScanError::query_failed(
                        format!("Failed to sample table '{}'", state.table),
                        e,
                    )
                })?
        };

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

        let batch: Vec<SampledRecord> = rows.iter().map(row_to_record).collect();
        Ok::<_, ScanError>(Some((batch, state)))
    })
    .boxed()
}

/// Converts a row to a record, dropping nulls and blobs.
pub fn row_to_record(row: &SqliteRow) -> SampledRecord {
    row.columns()
        .iter()
        .filter_map(|column| {
            extract_column_value(row, column.ordinal()).map(|v| (column.name().to_string(), v))
        })
        .collect()
}

/// Extract a column value as text.
fn extract_column_value(row: &SqliteRow, idx: usize) -> Option<String> {
    let raw = row.try_get_raw(idx).ok()?;
    if raw.is_null() || raw.type_info().name() == "BLOB" {
        return None;
    }

    // SQLite is dynamically typed, so we need to try multiple types
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v;
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|n| n.to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|n| n.to_string());
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(|b| b.to_string());
    }

    None
}
