//! Scan engine for finding unencrypted personal data in data stores.
//!
//! The engine samples records from relational databases, document stores and
//! local directories through one [`SourceAdapter`] contract, classifies every
//! sampled value against a [`RuleSet`], and aggregates the findings into a
//! [`Report`]. It only ever reads: nothing is blocked, redacted or modified
//! in the scanned source.
//!
//! # Security Guarantees
//! - All source sessions are read-only where the driver allows it
//! - Credentials never appear in logs, errors, `Debug` output or reports
//! - Matched values are kept only when `show_data` is requested
//!
//! # Architecture
//! - [`adapters`]: one adapter per source family plus the factory
//! - [`pool`]: bounded connection pool and the single shared connection
//! - [`rules`]: pattern detectors and validators
//! - [`scan`]: the orchestrator and per-unit scanning
//! - [`distributed`]: task contract for running unit-scans on workers
//! - [`events`]: lifecycle events for progress consumers
//! - [`report`]: the aggregated, serializable outcome
//!
//! # Example
//! ```rust,no_run
//! use pdscan_core::{AdapterConfig, RuleSet, ScanOptions, ScanOrchestrator, create_adapter};
//! use std::sync::Arc;
//!
//! # async fn run() -> pdscan_core::Result<()> {
//! let adapter = create_adapter(AdapterConfig::from_url("sqlite:app.db"))?;
//! let orchestrator = ScanOrchestrator::new(adapter, Arc::new(RuleSet::builtin()?));
//! let report = orchestrator
//!     .scan(&ScanOptions::default().with_sample_size(500))
//!     .await?;
//! println!("{} matches", report.matches.len());
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod distributed;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod pool;
pub mod report;
pub mod rules;
pub mod scan;
pub mod security;

// Re-export commonly used types
pub use adapters::{
    AdapterConfig, AdapterFactory, AdapterFeature, DefaultAdapterFactory, RecordBatchStream,
    ScanOptions, SourceAdapter, UnitFilter, create_adapter, detect_source_type,
};
pub use distributed::{
    LocalTaskQueue, TaskOutcome, TaskQueue, TaskTicket, UnitScanResult, UnitScanTask,
    execute_task, execute_task_until,
};
pub use error::{ErrorKind, Result, ScanError, redact_database_url};
pub use events::{EventBus, FanoutSink, JsonlSink, NoopSink, ScanEvent, ScanEventSink, TracingSink};
pub use models::{
    ConnectionModel, OrderingStrategy, SampledRecord, SortDirection, SourceType, Unit, UnitHandle,
};
pub use pool::{
    ConnectionManager, ConnectionPool, PoolConfig, PoolStats, PooledConnection, SharedConnection,
    SharedConnectionGuard, connect_with_retry,
};
pub use report::{Match, Report, ScanOutcome, UnitFailure, UnitSummary};
pub use rules::{ActiveRules, FieldMatch, Rule, RuleCategory, RuleSet};
pub use scan::{ScanOrchestrator, ScanState};
pub use security::Credentials;
