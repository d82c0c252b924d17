//! Record Types
//!
//! Values, records and the key format of the partitioned table, plus the
//! self-contained SQL rendering used for replicated copies of a write.

mod key;
pub mod sql;

pub use key::{KeyFormat, KeyRange};

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::config::ColumnKind;

/// Column values of a record, excluding the key
pub type Fields = BTreeMap<String, Value>;

/// SQL Value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Convert to a self-contained SQL literal
    pub fn to_sql(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => f.to_string(),
            Value::Float(_) => "NULL".to_string(),
            Value::Text(s) => sql::quote_literal(s),
        }
    }

    /// Text content, if this is a text value
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Check whether this value can be stored in a column of the given kind
    pub fn fits(&self, kind: ColumnKind) -> bool {
        match (self, kind) {
            (Value::Null, _) => true,
            (Value::Text(_), ColumnKind::Text) => true,
            (Value::Int(_) | Value::Bool(_), ColumnKind::Int) => true,
            (Value::Int(_) | Value::Float(_), ColumnKind::Float) => true,
            _ => false,
        }
    }

    /// Convert from a JSON value supplied by a client
    pub fn from_json(v: &serde_json::Value) -> Option<Value> {
        match v {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{}", s),
            other => write!(f, "{}", other.to_sql()),
        }
    }
}

/// A row of the partitioned table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub fields: Fields,
}

impl Record {
    pub fn new(key: impl Into<String>, fields: Fields) -> Self {
        Self {
            key: key.into(),
            fields,
        }
    }

    /// Value of the routing attribute, if present and textual
    pub fn route_value<'a>(&'a self, column: &str) -> Option<&'a str> {
        self.fields.get(column).and_then(Value::as_text)
    }

    /// Apply a partial update on top of this record
    pub fn merged(&self, changes: &Fields) -> Record {
        let mut fields = self.fields.clone();
        for (name, value) in changes {
            fields.insert(name.clone(), value.clone());
        }
        Record::new(self.key.clone(), fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_literals() {
        assert_eq!(Value::Null.to_sql(), "NULL");
        assert_eq!(Value::Bool(true).to_sql(), "1");
        assert_eq!(Value::Int(-42).to_sql(), "-42");
        assert_eq!(Value::Float(f64::NAN).to_sql(), "NULL");
        assert_eq!(Value::Text("O'Brien".into()).to_sql(), r"'O\'Brien'");
    }

    #[test]
    fn test_value_fits_column_kind() {
        assert!(Value::Int(1999).fits(ColumnKind::Int));
        assert!(Value::Int(3).fits(ColumnKind::Float));
        assert!(Value::Null.fits(ColumnKind::Text));
        assert!(!Value::Text("1999".into()).fits(ColumnKind::Int));
        assert!(!Value::Float(1.5).fits(ColumnKind::Int));
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from_json(&serde_json::json!(null)), Some(Value::Null));
        assert_eq!(Value::from_json(&serde_json::json!(1994)), Some(Value::Int(1994)));
        assert_eq!(Value::from_json(&serde_json::json!(7.5)), Some(Value::Float(7.5)));
        assert_eq!(
            Value::from_json(&serde_json::json!("Drama")),
            Some(Value::Text("Drama".into()))
        );
        assert_eq!(Value::from_json(&serde_json::json!([1, 2])), None);
    }

    #[test]
    fn test_merged_keeps_untouched_fields() {
        let mut fields = Fields::new();
        fields.insert("primary_title".into(), Value::Text("Apple".into()));
        fields.insert("start_year".into(), Value::Int(2001));
        let record = Record::new("tt0000001", fields);

        let mut changes = Fields::new();
        changes.insert("start_year".into(), Value::Int(2002));
        let merged = record.merged(&changes);

        assert_eq!(merged.route_value("primary_title"), Some("Apple"));
        assert_eq!(merged.fields["start_year"], Value::Int(2002));
    }
}
