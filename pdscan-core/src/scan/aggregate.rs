//! Report aggregation.

use super::UnitResult;
use super::unit::elapsed_ms;
use crate::adapters::ScanOptions;
use crate::report::{Match, Report, UnitFailure, UnitSummary};
use chrono::Utc;
use std::collections::BTreeSet;
use std::time::Instant;
use uuid::Uuid;

/// Single-writer accumulator turning unit results into a [`Report`].
#[derive(Debug)]
pub struct ReportBuilder {
    scan_id: Uuid,
    source: String,
    started_at: chrono::DateTime<Utc>,
    min_count: u64,
    active_rules: BTreeSet<String>,
    matches: Vec<Match>,
    scanned: Vec<String>,
    failed: Vec<UnitFailure>,
    summaries: Vec<UnitSummary>,
    records_sampled: u64,
}

impl ReportBuilder {
    pub fn new(
        scan_id: Uuid,
        source: impl Into<String>,
        options: &ScanOptions,
        active_rules: BTreeSet<String>,
    ) -> Self {
        Self {
            scan_id,
            source: source.into(),
            started_at: Utc::now(),
            min_count: u64::from(options.min_count),
            active_rules,
            matches: Vec::new(),
            scanned: Vec::new(),
            failed: Vec::new(),
            summaries: Vec::new(),
            records_sampled: 0,
        }
    }

    pub fn add(&mut self, result: UnitResult) {
        match result.outcome {
            Ok(output) => {
                self.records_sampled += output.records_sampled;
                self.scanned.push(result.unit);
                self.summaries.push(UnitSummary {
                    unit: output.unit,
                    records_sampled: output.records_sampled,
                    fields: output.fields,
                    duration_ms: output.duration_ms,
                });
                self.matches.extend(output.matches);
            }
            Err(failure) => self.failed.push(failure),
        }
    }

    /// Applies `min_count` and the active rule set, sorts, and seals the report.
    pub fn finish(self, cancelled: bool, started: Instant) -> Report {
        let Self {
            scan_id,
            source,
            started_at,
            min_count,
            active_rules,
            mut matches,
            mut scanned,
            mut failed,
            mut summaries,
            records_sampled,
        } = self;

        matches.retain(|m| m.count >= min_count && active_rules.contains(&m.rule_id));
        matches.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        scanned.sort();
        failed.sort_by(|a, b| a.unit.cmp(&b.unit));
        summaries.sort_by(|a, b| a.unit.cmp(&b.unit));

        Report {
            scan_id,
            source,
            matches,
            units_scanned: scanned,
            units_failed: failed,
            unit_summaries: summaries,
            records_sampled,
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed_ms(started),
            cancelled,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
