//! Scan options.
//!
//! Controls which units and rules a scan covers, how many records are read
//! per unit, how much concurrency is used and what ends up in the report.

use crate::error::{Result, ScanError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Options for one scan invocation.
///
/// Immutable for the duration of a scan. Call [`ScanOptions::validate`]
/// (the orchestrator does) before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Keep literal matched values in the report
    pub show_data: bool,
    /// List every sampled field in the per-unit summaries
    pub show_all: bool,
    /// Maximum records read per unit
    pub sample_size: u32,
    /// Concurrent unit-scans (1 means sequential)
    pub processes: u32,
    /// Unit names or glob patterns to include (empty means all)
    pub only_units: BTreeSet<String>,
    /// Unit names or glob patterns to exclude
    pub except_units: BTreeSet<String>,
    /// Matches seen fewer times than this are dropped
    pub min_count: u32,
    /// Rule ids to apply (empty means all)
    pub only_patterns: BTreeSet<String>,
    /// Rule ids to skip
    pub except_patterns: BTreeSet<String>,
    /// Extra regex applied as the `custom` rule
    pub custom_pattern: Option<String>,
    /// Deadline for a single unit-scan
    pub unit_timeout_secs: Option<u64>,
    /// Deadline for the whole scan; expiry cancels it
    pub scan_timeout_secs: Option<u64>,
    /// How long in-flight units may finish after cancellation
    pub cancel_grace_ms: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            show_data: false,
            show_all: false,
            sample_size: 1000,
            processes: 1,
            only_units: BTreeSet::new(),
            except_units: BTreeSet::new(),
            min_count: 1,
            only_patterns: BTreeSet::new(),
            except_patterns: BTreeSet::new(),
            custom_pattern: None,
            unit_timeout_secs: None,
            scan_timeout_secs: None,
            cancel_grace_ms: 2000,
        }
    }
}

fn to_set<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl ScanOptions {
    /// Creates scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks option consistency.
    ///
    /// Rule ids are checked against the catalogue separately, by
    /// [`crate::rules::RuleSet::select`].
    ///
    /// # Errors
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.sample_size == 0 {
            return Err(ScanError::configuration(
                "sample_size must be greater than 0",
            ));
        }

        if self.processes == 0 {
            return Err(ScanError::configuration(
                "processes must be greater than 0",
            ));
        }

        if self.min_count == 0 {
            return Err(ScanError::configuration(
                "min_count must be greater than 0",
            ));
        }

        if let Some(unit) = self.only_units.intersection(&self.except_units).next() {
            return Err(ScanError::configuration(format!(
                "unit '{}' is listed in both only_units and except_units",
                unit
            )));
        }

        if let Some(id) = self
            .only_patterns
            .intersection(&self.except_patterns)
            .next()
        {
            return Err(ScanError::configuration(format!(
                "pattern '{}' is listed in both only_patterns and except_patterns",
                id
            )));
        }

        if self.unit_timeout_secs == Some(0) || self.scan_timeout_secs == Some(0) {
            return Err(ScanError::configuration(
                "timeouts must be greater than 0",
            ));
        }

        Ok(())
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_secs.map(Duration::from_secs)
    }

    pub fn scan_timeout(&self) -> Option<Duration> {
        self.scan_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Builder method to keep matched values in the report.
    pub fn with_show_data(mut self, enabled: bool) -> Self {
        self.show_data = enabled;
        self
    }

    /// Builder method to list all sampled fields per unit.
    pub fn with_show_all(mut self, enabled: bool) -> Self {
        self.show_all = enabled;
        self
    }

    /// Builder method to set sample size.
    pub fn with_sample_size(mut self, size: u32) -> Self {
        self.sample_size = size;
        self
    }

    /// Builder method to set concurrency.
    pub fn with_processes(mut self, processes: u32) -> Self {
        self.processes = processes;
        self
    }

    /// Builder method to set the minimum match count.
    pub fn with_min_count(mut self, min_count: u32) -> Self {
        self.min_count = min_count;
        self
    }

    /// Builder method to restrict scanned units.
    pub fn with_only_units<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_units = to_set(units);
        self
    }

    /// Builder method to exclude units.
    pub fn with_except_units<I, S>(mut self, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.except_units = to_set(units);
        self
    }

    /// Builder method to restrict applied rules.
    pub fn with_only_patterns<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_patterns = to_set(ids);
        self
    }

    /// Builder method to skip rules.
    pub fn with_except_patterns<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.except_patterns = to_set(ids);
        self
    }

    /// Builder method to add the custom rule.
    pub fn with_custom_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.custom_pattern = Some(pattern.into());
        self
    }

    /// Builder method to set the per-unit deadline.
    pub fn with_unit_timeout_secs(mut self, secs: u64) -> Self {
        self.unit_timeout_secs = Some(secs);
        self
    }

    /// Builder method to set the whole-scan deadline.
    pub fn with_scan_timeout_secs(mut self, secs: u64) -> Self {
        self.scan_timeout_secs = Some(secs);
        self
    }

    /// Builder method to set the cancellation grace period.
    pub fn with_cancel_grace_ms(mut self, ms: u64) -> Self {
        self.cancel_grace_ms = ms;
        self
    }
}
