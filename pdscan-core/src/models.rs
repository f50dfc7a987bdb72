//! Source-agnostic data model shared by adapters, rules and the orchestrator.
//!
//! Every adapter converts what it reads into [`SampledRecord`]s so rule
//! evaluation never needs to know which store a value came from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Longest value (in characters) kept from a single field.
pub const MAX_VALUE_CHARS: usize = 4096;

/// Supported source families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    PostgreSQL,
    SQLite,
    MongoDB,
    Filesystem,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::PostgreSQL => write!(f, "PostgreSQL"),
            SourceType::SQLite => write!(f, "SQLite"),
            SourceType::MongoDB => write!(f, "MongoDB"),
            SourceType::Filesystem => write!(f, "Filesystem"),
        }
    }
}

/// How an adapter holds its connection(s) to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionModel {
    /// A bounded pool shared by concurrent unit-scans
    Pooled,
    /// One long-lived connection; statements are serialized
    SharedAsync,
    /// Nothing to hold between reads
    Stateless,
}

/// Adapter-specific locator for a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitHandle {
    /// Relational table, optionally schema-qualified
    Table {
        schema: Option<String>,
        table: String,
    },
    /// Document collection
    Collection {
        database: String,
        collection: String,
    },
    /// Filesystem directory (files directly inside it are sampled)
    Directory { path: PathBuf },
}

/// One scannable subdivision of a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unit {
    /// Qualified, human-readable name used for filtering and reporting
    pub name: String,
    pub handle: UnitHandle,
    /// Approximate record count when the source exposes one cheaply
    pub size_hint: Option<u64>,
}

impl Unit {
    /// Creates a table unit named `schema.table` (or just `table`).
    pub fn table(schema: Option<&str>, table: &str) -> Self {
        let name = match schema {
            Some(schema) => format!("{}.{}", schema, table),
            None => table.to_string(),
        };
        Self {
            name,
            handle: UnitHandle::Table {
                schema: schema.map(str::to_string),
                table: table.to_string(),
            },
            size_hint: None,
        }
    }

    /// Creates a collection unit named `database.collection`.
    pub fn collection(database: &str, collection: &str) -> Self {
        Self {
            name: format!("{}.{}", database, collection),
            handle: UnitHandle::Collection {
                database: database.to_string(),
                collection: collection.to_string(),
            },
            size_hint: None,
        }
    }

    /// Creates a directory unit with the given display name.
    pub fn directory(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            handle: UnitHandle::Directory { path: path.into() },
            size_hint: None,
        }
    }

    /// Builder method to set the size hint.
    pub fn with_size_hint(mut self, rows: u64) -> Self {
        self.size_hint = Some(rows);
        self
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Ordering strategy for data sampling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderingStrategy {
    /// Primary key ordering
    PrimaryKey { columns: Vec<String> },
    /// Timestamp column ordering
    Timestamp {
        column: String,
        direction: SortDirection,
    },
    /// System row ID ordering
    SystemRowId { column: String },
    /// No reliable ordering available
    Unordered,
}

/// Sort direction for ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One sampled row, document or line, as field name to textual value.
///
/// Nulls and binary values are omitted, nested documents are flattened into
/// dot-separated paths, and every value is capped at [`MAX_VALUE_CHARS`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampledRecord {
    fields: BTreeMap<String, String>,
}

impl SampledRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a field value, truncating it to [`MAX_VALUE_CHARS`].
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let mut value = value.into();
        if let Some((idx, _)) = value.char_indices().nth(MAX_VALUE_CHARS) {
            value.truncate(idx);
        }
        self.fields.insert(field.into(), value);
    }

    /// Builder form of [`SampledRecord::insert`].
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Flattens a JSON object into a record.
    ///
    /// Nested objects become `parent.child`, array elements become
    /// `parent.0`, `parent.1` and so on.
    pub fn from_json_object(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut record = Self::new();
        for (key, value) in object {
            record.flatten_json(key.clone(), value);
        }
        record
    }

    fn flatten_json(&mut self, path: String, value: &serde_json::Value) {
        use serde_json::Value;

        match value {
            Value::Null => {}
            Value::Bool(b) => self.insert(path, b.to_string()),
            Value::Number(n) => self.insert(path, n.to_string()),
            Value::String(s) => self.insert(path, s.as_str()),
            Value::Array(items) => {
                for (idx, item) in items.iter().enumerate() {
                    self.flatten_json(format!("{}.{}", path, idx), item);
                }
            }
            Value::Object(map) => {
                for (key, nested) in map {
                    self.flatten_json(format!("{}.{}", path, key), nested);
                }
            }
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SampledRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (field, value) in iter {
            record.insert(field, value);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_names() {
        assert_eq!(Unit::table(Some("public"), "users").name, "public.users");
        assert_eq!(Unit::table(None, "users").name, "users");
        assert_eq!(Unit::collection("app", "events").name, "app.events");
    }

    #[test]
    fn test_unit_handle_serialization() {
        let unit = Unit::table(Some("public"), "users").with_size_hint(42);
        let json = serde_json::to_string(&unit).unwrap();
        assert!(json.contains("\"kind\":\"table\""));

        let back: Unit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, unit);
    }

    #[test]
    fn test_record_flattens_nested_json() {
        let value = json!({
            "email": "a@example.com",
            "age": 31,
            "active": true,
            "deleted_at": null,
            "profile": { "phone": "555-123-4567", "tags": ["x", "y"] }
        });
        let record = SampledRecord::from_json_object(value.as_object().unwrap());

        assert_eq!(record.get("email"), Some("a@example.com"));
        assert_eq!(record.get("age"), Some("31"));
        assert_eq!(record.get("active"), Some("true"));
        assert_eq!(record.get("deleted_at"), None);
        assert_eq!(record.get("profile.phone"), Some("555-123-4567"));
        assert_eq!(record.get("profile.tags.1"), Some("y"));
    }

    #[test]
    fn test_record_truncates_long_values() {
        let long = "é".repeat(MAX_VALUE_CHARS + 10);
        let record = SampledRecord::new().with_field("notes", long);
        assert_eq!(
            record.get("notes").map(|v| v.chars().count()),
            Some(MAX_VALUE_CHARS)
        );
    }

    #[test]
    fn test_record_iterates_in_field_order() {
        let record: SampledRecord = [("b", "2"), ("a", "1")].into_iter().collect();
        let names: Vec<&str> = record.field_names().collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
