//! Pattern rules used to classify sampled values.
//!
//! A [`Rule`] pairs a regular expression with an optional structural
//! validator. A regex hit that fails validation is discarded, so for example
//! a sixteen digit number that fails the Luhn checksum is never reported as a
//! payment card.
//!
//! [`RuleSet::builtin`] provides the default catalogue. [`RuleSet::select`]
//! narrows it to the rules a scan asked for, producing [`ActiveRules`], which
//! is what the orchestrator evaluates records against. Evaluation is pure and
//! safe to share between concurrent unit-scans.

use crate::adapters::config::ScanOptions;
use crate::error::{Result, ScanError};
use crate::models::SampledRecord;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier given to the ad-hoc rule built from `custom_pattern`.
pub const CUSTOM_RULE_ID: &str = "custom";

/// Structural check applied to a regex candidate.
pub type Validator = fn(&str) -> bool;

/// Kind of personal data a rule detects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Email,
    CreditCard,
    Ssn,
    Phone,
    Network,
    Custom,
}

/// How likely a validated hit is to be real personal data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// A named detector for one category of personal data.
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    category: RuleCategory,
    confidence: Confidence,
    description: String,
    pattern: Regex,
    validator: Option<Validator>,
}

impl Rule {
    /// Compiles a rule from a regex source string.
    ///
    /// # Errors
    /// Returns a configuration error if the pattern is not a valid regex.
    pub fn new(id: impl Into<String>, category: RuleCategory, pattern: &str) -> Result<Self> {
        let id = id.into();
        let pattern = Regex::new(pattern).map_err(|e| {
            ScanError::configuration(format!("Invalid pattern for rule '{}': {}", id, e))
        })?;

        Ok(Self {
            id,
            category,
            confidence: Confidence::Medium,
            description: String::new(),
            pattern,
            validator: None,
        })
    }

    /// Builds the ad-hoc rule for a user-supplied pattern.
    pub fn custom(pattern: &str) -> Result<Self> {
        Ok(Self::new(CUSTOM_RULE_ID, RuleCategory::Custom, pattern)?
            .with_description("Custom pattern"))
    }

    /// Builder method to attach a structural validator.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Builder method to set the confidence level.
    pub fn with_confidence(mut self, confidence: Confidence) -> Self {
        self.confidence = confidence;
        self
    }

    /// Builder method to set a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> RuleCategory {
        self.category
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    /// Returns the first candidate in `value` that passes validation.
    pub fn find<'a>(&self, value: &'a str) -> Option<&'a str> {
        self.pattern
            .find_iter(value)
            .map(|m| m.as_str())
            .find(|candidate| self.validator.is_none_or(|validate| validate(candidate)))
    }

    /// Whether any candidate in `value` passes validation.
    pub fn is_match(&self, value: &str) -> bool {
        self.find(value).is_some()
    }
}

/// One validated rule hit on one field of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    pub field: String,
    pub rule_id: String,
    /// The literal matched text
    pub value: String,
}

/// Immutable catalogue of rules keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<String, Rule>,
}

impl RuleSet {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default detector catalogue.
    ///
    /// # Errors
    /// Only fails if a built-in pattern does not compile.
    pub fn builtin() -> Result<Self> {
        let rules = vec![
            Rule::new(
                "email",
                RuleCategory::Email,
                r"\b[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}\b",
            )?
            .with_confidence(Confidence::High)
            .with_description("Email address"),
            Rule::new(
                "credit_card",
                RuleCategory::CreditCard,
                concat!(
                    r"\b(?:",
                    r"4\d{3}(?:[\s._\-–]?\d{4}){3}",
                    r"|5[1-5]\d{2}(?:[\s._\-–]?\d{4}){3}",
                    r"|3[47]\d{2}[\s._\-–]?\d{6}[\s._\-–]?\d{5}",
                    r"|6011(?:[\s._\-–]?\d{4}){3}",
                    r")\b"
                ),
            )?
            .with_validator(luhn_valid)
            .with_confidence(Confidence::High)
            .with_description("Payment card number (Visa, MasterCard, AmEx, Discover)"),
            Rule::new(
                "credit_card_masked",
                RuleCategory::CreditCard,
                r"\b\d{4}[-\s]?(?:[\*X]{4}[-\s]?){1,2}\d{4}\b",
            )?
            .with_confidence(Confidence::Medium)
            .with_description("Masked payment card number"),
            Rule::new("ssn", RuleCategory::Ssn, r"\b\d{3}[-\s]?\d{2}[-\s]?\d{4}\b")?
                .with_validator(ssn_valid)
                .with_confidence(Confidence::Medium)
                .with_description("US Social Security Number"),
            Rule::new(
                "phone",
                RuleCategory::Phone,
                r"(?:\+\d{1,3}\s?)?\(?\b\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b",
            )?
            .with_validator(phone_valid)
            .with_confidence(Confidence::Medium)
            .with_description("Phone number"),
            Rule::new(
                "ipv4",
                RuleCategory::Network,
                r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
            )?
            .with_validator(ipv4_valid)
            .with_confidence(Confidence::Low)
            .with_description("IPv4 address"),
            Rule::new(
                "ipv6",
                RuleCategory::Network,
                r"(?i)\b(?:[a-f0-9]{1,4}:){7}[a-f0-9]{1,4}\b",
            )?
            .with_confidence(Confidence::Low)
            .with_description("IPv6 address"),
            Rule::new(
                "mac",
                RuleCategory::Network,
                r"\b(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}\b",
            )?
            .with_confidence(Confidence::Low)
            .with_description("MAC address"),
        ];

        let mut set = Self::new();
        for rule in rules {
            set.insert(rule);
        }
        Ok(set)
    }

    /// Adds or replaces a rule.
    pub fn insert(&mut self, rule: Rule) {
        self.rules.insert(rule.id.clone(), rule);
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    /// Rule ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolves the rules a scan applies.
    ///
    /// `only_patterns` restricts the catalogue, `except_patterns` removes from
    /// it, and `custom_pattern` adds the [`CUSTOM_RULE_ID`] rule.
    ///
    /// # Errors
    /// Returns a configuration error for an unknown rule id, an invalid custom
    /// pattern, or a selection that leaves nothing to apply.
    pub fn select(&self, options: &ScanOptions) -> Result<ActiveRules> {
        for id in options.only_patterns.iter().chain(&options.except_patterns) {
            if !self.contains(id) && id != CUSTOM_RULE_ID {
                return Err(ScanError::configuration(format!(
                    "Unknown pattern '{}'",
                    id
                )));
            }
        }

        let mut selected: Vec<Rule> = self
            .rules
            .values()
            .filter(|rule| {
                options.only_patterns.is_empty() || options.only_patterns.contains(&rule.id)
            })
            .filter(|rule| !options.except_patterns.contains(&rule.id))
            .cloned()
            .collect();

        if let Some(pattern) = &options.custom_pattern {
            selected.push(Rule::custom(pattern)?);
        }

        ActiveRules::new(selected)
    }

    /// Rebuilds an active set from explicit ids, as carried by a distributed task.
    pub fn select_ids(&self, ids: &[String], custom_pattern: Option<&str>) -> Result<ActiveRules> {
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            if id == CUSTOM_RULE_ID {
                let pattern = custom_pattern.ok_or_else(|| {
                    ScanError::configuration("Task requests the custom rule without a pattern")
                })?;
                selected.push(Rule::custom(pattern)?);
                continue;
            }
            let rule = self
                .get(id)
                .ok_or_else(|| ScanError::configuration(format!("Unknown pattern '{}'", id)))?;
            selected.push(rule.clone());
        }
        ActiveRules::new(selected)
    }
}

/// The rules applied by one scan, sorted by id.
#[derive(Debug, Clone)]
pub struct ActiveRules {
    rules: Vec<Rule>,
}

impl ActiveRules {
    fn new(mut rules: Vec<Rule>) -> Result<Self> {
        if rules.is_empty() {
            return Err(ScanError::configuration(
                "Pattern selection leaves no rules to apply",
            ));
        }
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules.dedup_by(|a, b| a.id == b.id);
        Ok(Self { rules })
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.rules.iter().map(|r| r.id.clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.iter().any(|r| r.id == id)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every active rule to every field of `record`.
    ///
    /// Yields at most one hit per (field, rule), carrying the first
    /// candidate that passed validation.
    pub fn evaluate(&self, record: &SampledRecord) -> Vec<FieldMatch> {
        let mut hits = Vec::new();
        for (field, value) in record.iter() {
            if value.is_empty() {
                continue;
            }
            for rule in &self.rules {
                if let Some(candidate) = rule.find(value) {
                    hits.push(FieldMatch {
                        field: field.to_string(),
                        rule_id: rule.id.clone(),
                        value: candidate.to_string(),
                    });
                }
            }
        }
        hits
    }
}

fn digits(value: &str) -> Vec<u32> {
    value.chars().filter_map(|c| c.to_digit(10)).collect()
}

/// Luhn (mod 10) checksum over the digits in `value`.
pub fn luhn_valid(value: &str) -> bool {
    let digits = digits(value);
    if !(13..=19).contains(&digits.len()) {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, &d)| {
            if idx % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();

    sum % 10 == 0
}

/// Rejects SSNs the issuing authority never assigns.
pub fn ssn_valid(value: &str) -> bool {
    let digits = digits(value);
    if digits.len() != 9 {
        return false;
    }
    let area = digits[0] * 100 + digits[1] * 10 + digits[2];
    let group = digits[3] * 10 + digits[4];
    let serial = digits[5..].iter().fold(0, |acc, d| acc * 10 + d);

    area != 0 && area != 666 && area < 900 && group != 0 && serial != 0
}

fn phone_valid(value: &str) -> bool {
    (10..=15).contains(&digits(value).len())
}

fn ipv4_valid(value: &str) -> bool {
    value
        .split('.')
        .all(|octet| octet.parse::<u16>().is_ok_and(|n| n <= 255))
}
