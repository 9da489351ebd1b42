//! Raw and cleaned record shapes.

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::types::DataType;

/// A record as returned by a record source: an opaque JSON object.
pub type RawRecord = Map<String, Value>;

/// A cleaned, export-ready record.
///
/// Serializes as a flat object: `record_type`, then the known fields for that
/// type in declaration order, then any extra fields carried over verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub record_type: DataType,
    /// Allow-listed fields, validated and normalized.
    pub fields: IndexMap<String, Value>,
    /// Every other field from the raw record, untouched.
    pub extra: IndexMap<String, Value>,
}

impl ExportRecord {
    pub fn new(record_type: DataType) -> Self {
        Self {
            record_type,
            fields: IndexMap::new(),
            extra: IndexMap::new(),
        }
    }

    /// Look up a field in either bucket.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if key == "record_type" {
            return None;
        }
        self.fields.get(key).or_else(|| self.extra.get(key))
    }

    /// All output keys, in serialization order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once("record_type")
            .chain(self.fields.keys().map(String::as_str))
            .chain(self.extra.keys().map(String::as_str))
    }

    /// Value for an output column, `None` when this record lacks the key.
    pub fn column(&self, key: &str) -> Option<Value> {
        if key == "record_type" {
            Some(Value::String(self.record_type.to_string()))
        } else {
            self.get(key).cloned()
        }
    }
}

impl Serialize for ExportRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1 + self.fields.len() + self.extra.len()))?;
        map.serialize_entry("record_type", &self.record_type)?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        for (k, v) in &self.extra {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ExportRecord {
        let mut rec = ExportRecord::new(DataType::Logs);
        rec.fields.insert("timestamp".into(), json!("2024-01-01T00:00:00+00:00"));
        rec.fields.insert("message".into(), json!("hello"));
        rec.extra.insert("trace_id".into(), json!("abc"));
        rec
    }

    #[test]
    fn serializes_flat_in_order() {
        let text = serde_json::to_string(&sample()).unwrap();
        assert_eq!(
            text,
            r#"{"record_type":"logs","timestamp":"2024-01-01T00:00:00+00:00","message":"hello","trace_id":"abc"}"#
        );
    }

    #[test]
    fn keys_and_columns() {
        let rec = sample();
        let keys: Vec<&str> = rec.keys().collect();
        assert_eq!(keys, vec!["record_type", "timestamp", "message", "trace_id"]);
        assert_eq!(rec.column("record_type"), Some(json!("logs")));
        assert_eq!(rec.column("trace_id"), Some(json!("abc")));
        assert_eq!(rec.column("missing"), None);
    }
}
