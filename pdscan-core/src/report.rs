//! Aggregated scan results.
//!
//! A [`Report`] is built by the orchestrator's single aggregation loop and is
//! immutable once returned. It is `Serialize` so external consumers can write
//! it in whatever format they need.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Distinct literal values retained per match when `show_data` is set.
pub const MAX_SAMPLES_PER_MATCH: usize = 5;

/// Aggregated finding of one rule on one field within one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub unit: String,
    pub field: String,
    pub rule_id: String,
    /// Exact number of sampled records whose field matched
    pub count: u64,
    /// Distinct matched values, only populated when `show_data` is set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<String>,
    /// More distinct values matched than were retained
    #[serde(default)]
    pub truncated: bool,
}

impl Match {
    /// Sort key giving reports their deterministic order.
    pub fn sort_key(&self) -> (&str, &str, &str) {
        (&self.unit, &self.field, &self.rule_id)
    }
}

/// A unit that could not be scanned completely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Per-unit bookkeeping for a successfully scanned unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub unit: String,
    pub records_sampled: u64,
    /// Every sampled field, only populated when `show_all` is set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub duration_ms: u64,
}

/// Overall classification of a finished scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOutcome {
    /// Every unit scanned, nothing found
    Clean,
    /// Every unit scanned, at least one match
    MatchesFound,
    /// Some units failed or the scan was cancelled
    Incomplete,
}

/// Outcome of one scan invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub scan_id: uuid::Uuid,
    /// Redacted source description
    pub source: String,
    /// Sorted by (unit, field, rule_id)
    pub matches: Vec<Match>,
    /// Units that completed, sorted by name
    pub units_scanned: Vec<String>,
    /// Sorted by unit name
    pub units_failed: Vec<UnitFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unit_summaries: Vec<UnitSummary>,
    pub records_sampled: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub engine_version: String,
}

impl Report {
    pub fn outcome(&self) -> ScanOutcome {
        if self.cancelled || !self.units_failed.is_empty() {
            ScanOutcome::Incomplete
        } else if self.matches.is_empty() {
            ScanOutcome::Clean
        } else {
            ScanOutcome::MatchesFound
        }
    }

    /// Process exit status for command-line drivers.
    ///
    /// `0` clean, `1` matches found, `2` incomplete.
    pub fn exit_code(&self) -> i32 {
        match self.outcome() {
            ScanOutcome::Clean => 0,
            ScanOutcome::MatchesFound => 1,
            ScanOutcome::Incomplete => 2,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.outcome() == ScanOutcome::Incomplete
    }

    /// Matches for one unit, in report order.
    pub fn matches_for<'a>(&'a self, unit: &'a str) -> impl Iterator<Item = &'a Match> + 'a {
        self.matches.iter().filter(move |m| m.unit == unit)
    }

    pub fn failure_for(&self, unit: &str) -> Option<&UnitFailure> {
        self.units_failed.iter().find(|f| f.unit == unit)
    }
}
