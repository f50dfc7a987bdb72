//! Library module for the pdscan command-line driver.
//!
//! Argument parsing and the mapping from flags onto engine configuration
//! live here so they can be tested; `main.rs` only wires them to the runtime.

use clap::{Args, Parser, ValueEnum};
use pdscan_core::{AdapterConfig, Report, ScanOptions};
use std::fmt::Write as _;

/// Process exit status when the scan could not run at all.
pub const EXIT_FATAL: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "pdscan")]
#[command(about = "Scan data stores for unencrypted personal data")]
#[command(version)]
#[command(long_about = "
pdscan samples records from a data store and reports fields that look like
personal data (emails, payment cards, SSNs, phone numbers, network addresses).

SECURITY FEATURES:
- Read-only sessions only
- No credentials logged or reported
- Matched values are only printed with --show-data

SUPPORTED SOURCES:
- PostgreSQL (postgres://)
- SQLite (sqlite: or .db/.sqlite/.sqlite3 files)
- MongoDB (mongodb://) [if compiled with --features mongodb]
- Local directories (file:// or a plain path)

EXIT STATUS:
  0 nothing found, 1 matches found, 2 incomplete scan, 3 scan could not run

EXAMPLES:
  pdscan postgres://scanner@localhost/app
  pdscan --only-patterns email,ssn --show-data sqlite:app.db
  pdscan --processes 4 --format json ./exports
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Data store URL or directory path
    #[arg(
        env = "PDSCAN_URL",
        help = "Data store URL (credentials will be sanitized in logs)"
    )]
    pub url: String,

    #[command(flatten)]
    pub scan: ScanArgs,

    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Report format written to stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Stream lifecycle events to stderr as JSON lines
    #[arg(long)]
    pub events: bool,

    /// Run unit-scans through the in-process task queue
    #[arg(long)]
    pub distributed: bool,

    /// Seconds to wait for one distributed task
    #[arg(long, default_value = "300", requires = "distributed")]
    pub task_timeout: u64,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Show matched data values
    #[arg(long)]
    pub show_data: bool,

    /// List every sampled field per unit
    #[arg(long)]
    pub show_all: bool,

    /// Records sampled per unit
    #[arg(long, default_value = "1000")]
    pub sample_size: u32,

    /// Units scanned concurrently
    #[arg(long, default_value = "1")]
    pub processes: u32,

    /// Only scan these units (comma-separated, globs allowed)
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Skip these units (comma-separated, globs allowed)
    #[arg(long = "except", value_delimiter = ',')]
    pub except: Vec<String>,

    /// Minimum number of matching records to report a field
    #[arg(long, default_value = "1")]
    pub min_count: u32,

    /// Custom regex reported as the `custom` rule
    #[arg(long)]
    pub pattern: Option<String>,

    /// Only apply these rules (comma-separated rule ids)
    #[arg(long, value_delimiter = ',')]
    pub only_patterns: Vec<String>,

    /// Skip these rules (comma-separated rule ids)
    #[arg(long, value_delimiter = ',')]
    pub except_patterns: Vec<String>,

    /// Seconds allowed for a single unit
    #[arg(long)]
    pub unit_timeout: Option<u64>,

    /// Seconds allowed for the whole scan
    #[arg(long)]
    pub scan_timeout: Option<u64>,

    /// Milliseconds running units may finish after cancellation
    #[arg(long, default_value = "2000")]
    pub cancel_grace_ms: u64,
}

#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Maximum pooled connections
    #[arg(long)]
    pub pool_size: Option<u32>,

    /// Connect and acquire timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Connection attempts before giving up
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Records fetched per page
    #[arg(long)]
    pub fetch_size: Option<u32>,

    /// Units in flight on a single shared connection (SQLite)
    #[arg(long)]
    pub max_concurrent_tables: Option<u32>,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all log output except errors")]
    pub quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    /// Adapter configuration described by the flags.
    pub fn adapter_config(&self) -> AdapterConfig {
        let mut config = if self.url.contains("://") || is_sqlite_path(&self.url) {
            AdapterConfig::from_url(&self.url)
        } else {
            AdapterConfig::filesystem(&self.url)
        };

        let conn = &self.connection;
        if let Some(size) = conn.pool_size {
            config.pool_size = size;
        }
        if let Some(secs) = conn.timeout {
            config = config.with_timeout_secs(secs);
        }
        if let Some(attempts) = conn.retry_attempts {
            config = config.with_retry_attempts(attempts);
        }
        if let Some(fetch) = conn.fetch_size {
            config = config.with_fetch_size(fetch);
        }
        if let Some(max) = conn.max_concurrent_tables {
            config = config.with_max_concurrent_tables(max);
        }
        config
    }

    /// Scan options described by the flags.
    pub fn scan_options(&self) -> ScanOptions {
        let args = &self.scan;
        let mut options = ScanOptions::new()
            .with_show_data(args.show_data)
            .with_show_all(args.show_all)
            .with_sample_size(args.sample_size)
            .with_processes(args.processes)
            .with_min_count(args.min_count)
            .with_only_units(args.only.iter().cloned())
            .with_except_units(args.except.iter().cloned())
            .with_only_patterns(args.only_patterns.iter().map(|id| normalize_rule_id(id)))
            .with_except_patterns(args.except_patterns.iter().map(|id| normalize_rule_id(id)));

        if let Some(pattern) = &args.pattern {
            options = options.with_custom_pattern(pattern.clone());
        }
        if let Some(secs) = args.unit_timeout {
            options = options.with_unit_timeout_secs(secs);
        }
        if let Some(secs) = args.scan_timeout {
            options = options.with_scan_timeout_secs(secs);
        }
        options.cancel_grace_ms = args.cancel_grace_ms;
        options
    }
}

fn is_sqlite_path(url: &str) -> bool {
    url.starts_with("sqlite:")
        || url == ":memory:"
        || [".db", ".sqlite", ".sqlite3"]
            .iter()
            .any(|ext| url.ends_with(ext))
}

/// Accepts `credit-card` as well as `credit_card`.
pub fn normalize_rule_id(id: &str) -> String {
    id.trim().replace('-', "_")
}

/// Human-readable rendering of a report.
pub fn render_text(report: &Report) -> String {
    let mut out = String::new();

    if report.matches.is_empty() {
        out.push_str("No matches found.\n");
    }
    for m in &report.matches {
        let _ = write!(
            out,
            "{}.{}: found {} ({} record{})",
            m.unit,
            m.field,
            m.rule_id,
            m.count,
            if m.count == 1 { "" } else { "s" }
        );
        if !m.samples.is_empty() {
            let _ = write!(out, " {}", m.samples.join(", "));
            if m.truncated {
                out.push_str(", ...");
            }
        }
        out.push('\n');
    }

    for summary in &report.unit_summaries {
        if !summary.fields.is_empty() {
            let _ = writeln!(out, "{}: {}", summary.unit, summary.fields.join(", "));
        }
    }

    if !report.units_failed.is_empty() {
        let _ = writeln!(out, "\nFailed units:");
        for failure in &report.units_failed {
            let _ = writeln!(
                out,
                "  {} [{}] {}",
                failure.unit, failure.error_kind, failure.message
            );
        }
    }

    let _ = writeln!(
        out,
        "\nScanned {} unit{} ({} records) in {} ms{}",
        report.units_scanned.len(),
        if report.units_scanned.len() == 1 { "" } else { "s" },
        report.records_sampled,
        report.duration_ms,
        if report.cancelled { ", cancelled" } else { "" }
    );
    out
}
