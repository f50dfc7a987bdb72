//! Single unit-scan: sample, evaluate, accumulate.

use crate::Result;
use crate::adapters::{ScanOptions, SourceAdapter};
use crate::error::ScanError;
use crate::models::Unit;
use crate::report::{MAX_SAMPLES_PER_MATCH, Match};
use crate::rules::{ActiveRules, FieldMatch};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// What one successful unit-scan produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitScanOutput {
    pub unit: String,
    /// One entry per (field, rule), sorted; not yet filtered by `min_count`
    pub matches: Vec<Match>,
    pub records_sampled: u64,
    /// Every field seen, only populated when `show_all` is set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct MatchTally {
    count: u64,
    samples: Vec<String>,
    truncated: bool,
}

/// Per-unit accumulation keyed by (field, rule id).
///
/// Counts are exact. With `show_data`, at most [`MAX_SAMPLES_PER_MATCH`]
/// distinct values are kept per key, in first-seen order.
#[derive(Debug)]
pub struct UnitAccumulator {
    unit: String,
    show_data: bool,
    show_all: bool,
    tallies: BTreeMap<(String, String), MatchTally>,
    fields: BTreeSet<String>,
    records: u64,
}

impl UnitAccumulator {
    pub fn new(unit: impl Into<String>, options: &ScanOptions) -> Self {
        Self {
            unit: unit.into(),
            show_data: options.show_data,
            show_all: options.show_all,
            tallies: BTreeMap::new(),
            fields: BTreeSet::new(),
            records: 0,
        }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn record_fields<'a>(&mut self, names: impl Iterator<Item = &'a str>) {
        if self.show_all {
            for name in names {
                if !self.fields.contains(name) {
                    self.fields.insert(name.to_string());
                }
            }
        }
    }

    /// Adds the hits of one record. Evaluation yields at most one hit per
    /// (field, rule), so each call adds at most one to every count.
    pub fn add_record(&mut self, hits: Vec<FieldMatch>) {
        self.records += 1;
        for hit in hits {
            let tally = self.tallies.entry((hit.field, hit.rule_id)).or_default();
            tally.count += 1;
            if !self.show_data || tally.samples.contains(&hit.value) {
                continue;
            }
            if tally.samples.len() < MAX_SAMPLES_PER_MATCH {
                tally.samples.push(hit.value);
            } else {
                tally.truncated = true;
            }
        }
    }

    pub fn finish(self, started: Instant) -> UnitScanOutput {
        let unit = self.unit;
        let matches = self
            .tallies
            .into_iter()
            .map(|((field, rule_id), tally)| Match {
                unit: unit.clone(),
                field,
                rule_id,
                count: tally.count,
                samples: tally.samples,
                truncated: tally.truncated,
            })
            .collect();

        UnitScanOutput {
            unit,
            matches,
            records_sampled: self.records,
            fields: self.fields.into_iter().collect(),
            duration_ms: elapsed_ms(started),
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Scans one unit to completion.
///
/// Reads at most `options.sample_size` records even if the adapter yields
/// more, and checks `abort` between batches.
///
/// # Errors
/// Returns whatever the adapter reports, or [`ScanError::Cancelled`] once
/// `abort` fires.
pub async fn scan_unit(
    adapter: &dyn SourceAdapter,
    unit: &Unit,
    rules: &ActiveRules,
    options: &ScanOptions,
    abort: &CancellationToken,
) -> Result<UnitScanOutput> {
    let started = Instant::now();
    let limit = u64::from(options.sample_size);
    let mut acc = UnitAccumulator::new(&unit.name, options);

    let mut batches = tokio::select! {
        biased;
        _ = abort.cancelled() => return Err(ScanError::Cancelled),
        stream = adapter.sample(unit, options.sample_size) => stream?,
    };

    'batches: loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => return Err(ScanError::Cancelled),
            next = batches.next() => next,
        };
        let Some(batch) = next else { break };

        for record in batch? {
            if acc.records() >= limit {
                break 'batches;
            }
            acc.record_fields(record.field_names());
            acc.add_record(rules.evaluate(&record));
        }
        if acc.records() >= limit {
            break;
        }
    }

    tracing::debug!(
        "Scanned unit '{}': {} records",
        unit.name,
        acc.records()
    );
    Ok(acc.finish(started))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(field: &str, rule: &str, value: &str) -> FieldMatch {
        FieldMatch {
            field: field.to_string(),
            rule_id: rule.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_counts_are_exact_without_samples() {
        let mut acc = UnitAccumulator::new("users", &ScanOptions::default());
        acc.add_record(vec![hit("email", "email", "a@x.io")]);
        acc.add_record(vec![hit("email", "email", "b@x.io")]);
        acc.add_record(vec![]);

        let out = acc.finish(Instant::now());
        assert_eq!(out.records_sampled, 3);
        assert_eq!(out.matches.len(), 1);
        assert_eq!(out.matches[0].count, 2);
        assert!(out.matches[0].samples.is_empty());
        assert!(!out.matches[0].truncated);
        assert!(out.fields.is_empty());
    }

    #[test]
    fn test_samples_are_distinct_and_bounded() {
        let options = ScanOptions::default().with_show_data(true);
        let mut acc = UnitAccumulator::new("users", &options);
        for i in 0..5 {
            acc.add_record(vec![hit("email", "email", &format!("u{}@x.io", i))]);
        }
        acc.add_record(vec![hit("email", "email", "u0@x.io")]);

        let out = acc.finish(Instant::now());
        assert_eq!(out.matches[0].count, 6);
        assert_eq!(out.matches[0].samples.len(), 5);
        assert_eq!(out.matches[0].samples[0], "u0@x.io");
        assert!(!out.matches[0].truncated);

        let mut acc = UnitAccumulator::new("users", &options);
        for i in 0..7 {
            acc.add_record(vec![hit("email", "email", &format!("u{}@x.io", i))]);
        }
        let out = acc.finish(Instant::now());
        assert_eq!(out.matches[0].samples.len(), MAX_SAMPLES_PER_MATCH);
        assert!(out.matches[0].truncated);
    }

    #[test]
    fn test_matches_sorted_by_field_then_rule() {
        let mut acc = UnitAccumulator::new("t", &ScanOptions::default());
        acc.add_record(vec![
            hit("notes", "ssn", "123-45-6789"),
            hit("contact", "phone", "555-123-4567"),
            hit("contact", "email", "a@x.io"),
        ]);
        let out = acc.finish(Instant::now());
        let keys: Vec<_> = out
            .matches
            .iter()
            .map(|m| (m.field.as_str(), m.rule_id.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![("contact", "email"), ("contact", "phone"), ("notes", "ssn")]
        );
        assert!(out.matches.iter().all(|m| m.unit == "t"));
    }

    #[test]
    fn test_show_all_collects_fields() {
        let options = ScanOptions::default().with_show_all(true);
        let mut acc = UnitAccumulator::new("t", &options);
        acc.record_fields(["b", "a"].into_iter());
        acc.record_fields(["a", "c"].into_iter());
        let out = acc.finish(Instant::now());
        assert_eq!(out.fields, vec!["a", "b", "c"]);
    }
}
