//! Unit include/exclude filtering.
//!
//! Filter entries are exact unit names or glob patterns:
//! - `*` matches any sequence of characters
//! - `?` matches any single character
//!
//! An entry matches either the qualified unit name (`public.users`) or the
//! bare table/collection name (`users`).

use super::ScanOptions;
use crate::models::{Unit, UnitHandle};
use std::collections::BTreeSet;

/// Include/exclude lists applied during enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    only: BTreeSet<String>,
    except: BTreeSet<String>,
}

impl UnitFilter {
    /// A filter that admits every unit.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(only: BTreeSet<String>, except: BTreeSet<String>) -> Self {
        Self { only, except }
    }

    pub fn from_options(options: &ScanOptions) -> Self {
        Self::new(options.only_units.clone(), options.except_units.clone())
    }

    /// Whether `unit` survives both lists.
    pub fn matches(&self, unit: &Unit) -> bool {
        let short = match &unit.handle {
            UnitHandle::Table { table, .. } => Some(table.as_str()),
            UnitHandle::Collection { collection, .. } => Some(collection.as_str()),
            UnitHandle::Directory { .. } => None,
        };
        let hit = |patterns: &BTreeSet<String>| {
            matches_any_pattern(&unit.name, patterns)
                || short.is_some_and(|s| matches_any_pattern(s, patterns))
        };

        (self.only.is_empty() || hit(&self.only)) && !hit(&self.except)
    }

    /// Keeps matching units and sorts them by name.
    pub fn apply(&self, units: Vec<Unit>) -> Vec<Unit> {
        let mut kept: Vec<Unit> = units.into_iter().filter(|u| self.matches(u)).collect();
        kept.sort_by(|a, b| a.name.cmp(&b.name));
        kept
    }
}

/// Checks if a name matches any of the given glob patterns.
pub fn matches_any_pattern<'a>(name: &str, patterns: impl IntoIterator<Item = &'a String>) -> bool {
    patterns.into_iter().any(|pattern| glob_match(pattern, name))
}

/// Simple glob pattern matching supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    glob_match_from(&pattern_chars, &text_chars, 0, 0)
}

fn glob_match_from(pattern: &[char], text: &[char], mut pi: usize, mut ti: usize) -> bool {
    while pi < pattern.len() {
        match pattern[pi] {
            '*' => {
                while pi < pattern.len() && pattern[pi] == '*' {
                    pi += 1;
                }
                if pi == pattern.len() {
                    return true;
                }
                return (ti..=text.len()).any(|start| glob_match_from(pattern, text, pi, start));
            }
            '?' => {
                if ti >= text.len() {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
            c => {
                if ti >= text.len() || text[ti] != c {
                    return false;
                }
                pi += 1;
                ti += 1;
            }
        }
    }

    ti == text.len()
}
