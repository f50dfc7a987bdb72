//! Unit tests for SQLite adapter.
//!
//! These tests build throwaway database files and verify:
//! - Table enumeration and filtering
//! - Paged sampling bounded by sample size
//! - Ordering detection against real schemas
//! - Read-only access and idempotent close

use crate::Result;
use crate::adapters::{AdapterConfig, AdapterFeature, SourceAdapter, UnitFilter};
use crate::models::{ConnectionModel, OrderingStrategy, SourceType};
use futures::TryStreamExt;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::collections::BTreeSet;
use std::path::Path;

use super::SqliteAdapter;

async fn create_database(path: &Path, statements: &[&str]) {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
    for statement in statements {
        sqlx::query(statement).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();
}

async fn connected_adapter(path: &Path, fetch_size: u32) -> SqliteAdapter {
    let config = AdapterConfig::from_url(path.to_string_lossy())
        .with_fetch_size(fetch_size)
        .with_retry_attempts(1);
    let adapter = SqliteAdapter::new(config).unwrap();
    adapter.connect().await.unwrap();
    adapter
}

// =============================================================================
// Adapter Metadata Tests
// =============================================================================

#[test]
fn test_adapter_metadata() {
    let adapter = SqliteAdapter::new(AdapterConfig::from_url("sqlite::memory:")).unwrap();
    assert_eq!(adapter.source_type(), SourceType::SQLite);
    assert_eq!(adapter.connection_model(), ConnectionModel::SharedAsync);
    assert!(adapter.is_in_memory());
    assert!(adapter.supports_feature(AdapterFeature::DataSampling));
    assert!(!adapter.supports_feature(AdapterFeature::ConnectionPooling));
}

#[test]
fn test_debug_omits_connection_string() {
    let adapter = SqliteAdapter::new(AdapterConfig::from_url("/srv/secret-path/app.db")).unwrap();
    let debug = format!("{:?}", adapter);
    assert!(debug.contains("SqliteAdapter"));
    assert!(debug.contains("connected: false"));
}

#[tokio::test]
async fn test_use_before_connect_is_error() {
    let adapter = SqliteAdapter::new(AdapterConfig::from_url("sqlite::memory:")).unwrap();
    assert!(adapter.enumerate_units(&UnitFilter::all()).await.is_err());
}

// =============================================================================
// Enumeration Tests
// =============================================================================

#[tokio::test]
async fn test_enumerates_user_tables_sorted() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    create_database(
        &path,
        &[
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, email TEXT)",
            "CREATE TABLE audit_log (message TEXT)",
            "CREATE VIEW user_emails AS SELECT email FROM users",
        ],
    )
    .await;

    let adapter = connected_adapter(&path, 100).await;
    let units = adapter.enumerate_units(&UnitFilter::all()).await?;
    let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
    // sqlite_sequence (from AUTOINCREMENT) and views are excluded
    assert_eq!(names, vec!["audit_log", "users"]);

    let only = UnitFilter::new(BTreeSet::from(["users".to_string()]), BTreeSet::new());
    let units = adapter.enumerate_units(&only).await?;
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].name, "users");

    adapter.close().await?;
    Ok(())
}

// =============================================================================
// Sampling Tests
// =============================================================================

#[tokio::test]
async fn test_sample_is_bounded_and_paged() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.db");
    create_database(
        &path,
        &[
            "CREATE TABLE people (id INTEGER PRIMARY KEY, email TEXT, phone INTEGER, photo BLOB)",
            "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 250) \
             INSERT INTO people (id, email, phone, photo) \
             SELECT n, 'user' || n || '@example.com', 5550000000 + n, x'00ff' FROM seq",
        ],
    )
    .await;

    let adapter = connected_adapter(&path, 40).await;
    let units = adapter.enumerate_units(&UnitFilter::all()).await?;
    let batches: Vec<_> = adapter.sample(&units[0], 100).await?.try_collect().await?;

    // 40 + 40 + 20
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![40, 40, 20]);

    let records: Vec<_> = batches.into_iter().flatten().collect();
    // Most recent primary key first
    assert_eq!(records[0].get("email"), Some("user250@example.com"));
    assert_eq!(records[0].get("phone"), Some("5550000250"));
    assert_eq!(records[0].get("photo"), None);
    assert_eq!(records[0].get("id"), Some("250"));

    let distinct: BTreeSet<_> = records.iter().filter_map(|r| r.get("id")).collect();
    assert_eq!(distinct.len(), 100);

    adapter.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_sample_of_small_table_stops_early() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("small.db");
    create_database(
        &path,
        &[
            "CREATE TABLE notes (body TEXT)",
            "INSERT INTO notes (body) VALUES ('call 555-123-4567'), (NULL), ('plain')",
        ],
    )
    .await;

    let adapter = connected_adapter(&path, 10).await;
    let units = adapter.enumerate_units(&UnitFilter::all()).await?;
    let records: Vec<_> = adapter
        .sample(&units[0], 1000)
        .await?
        .try_collect::<Vec<_>>()
        .await?
        .into_iter()
        .flatten()
        .collect();

    assert_eq!(records.len(), 3);
    assert_eq!(records.iter().filter(|r| r.is_empty()).count(), 1);

    adapter.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_ordering_detection_on_real_schema() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("order.db");
    create_database(
        &path,
        &[
            "CREATE TABLE keyed (tenant TEXT, id INTEGER, PRIMARY KEY (tenant, id))",
            "CREATE TABLE events (payload TEXT, created_at TIMESTAMP)",
            "CREATE TABLE bare (payload TEXT)",
        ],
    )
    .await;

    let adapter = connected_adapter(&path, 10).await;
    assert_eq!(
        adapter.ordering_for("keyed").await?,
        OrderingStrategy::PrimaryKey {
            columns: vec!["tenant".to_string(), "id".to_string()]
        }
    );
    assert!(matches!(
        adapter.ordering_for("events").await?,
        OrderingStrategy::Timestamp { .. }
    ));
    assert_eq!(
        adapter.ordering_for("bare").await?,
        OrderingStrategy::SystemRowId {
            column: "rowid".to_string()
        }
    );

    adapter.close().await?;
    Ok(())
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_connection_is_read_only() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.db");
    create_database(&path, &["CREATE TABLE t (v TEXT)"]).await;

    let adapter = connected_adapter(&path, 10).await;
    let shared = adapter.shared()?;
    let mut conn = shared.lock().await?;
    let write = sqlx::query("INSERT INTO t (v) VALUES ('x')")
        .execute(&mut *conn)
        .await;
    assert!(write.is_err());
    drop(conn);

    adapter.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_missing_database_fails_to_connect() {
    let dir = tempfile::tempdir().unwrap();
    let config = AdapterConfig::from_url(dir.path().join("nope.db").to_string_lossy())
        .with_retry_attempts(1);
    let adapter = SqliteAdapter::new(config).unwrap();
    assert!(adapter.connect().await.is_err());
}

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("close.db");
    create_database(&path, &["CREATE TABLE t (v TEXT)"]).await;

    let adapter = connected_adapter(&path, 10).await;
    adapter.close().await?;
    adapter.close().await?;
    assert!(adapter.enumerate_units(&UnitFilter::all()).await.is_err());

    // Never connected
    let idle = SqliteAdapter::new(AdapterConfig::from_url("sqlite::memory:"))?;
    idle.close().await?;
    Ok(())
}
