//! Record cleaning: raw source maps in, typed [`ExportRecord`]s out.
//!
//! Each record type has an allow-list of known fields. Required fields are
//! checked for presence and type; a record that fails is dropped and logged,
//! never failing the batch. Optional fields are normalized when well-formed
//! and otherwise carried in the extra bucket so nothing is silently lost.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Number, Value};
use thiserror::Error;
use tracing::warn;

use crate::record::{ExportRecord, RawRecord};
use crate::types::DataType;

/// Keys probed, in order, for the record-type discriminator.
const TYPE_KEYS: &[&str] = &["record_type", "type", "data_type"];

/// Marker set on a record when an embedded JSON blob failed to parse.
pub const PARSE_ERROR_KEY: &str = "_parse_error";

/// Epoch values above this magnitude are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Why a raw record was dropped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordRejection {
    #[error("no record type and more than one type requested")]
    MissingType,

    #[error("unknown record type '{0}'")]
    UnknownType(String),

    #[error("record type '{0}' not requested")]
    NotRequested(DataType),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("field '{0}' is not a valid timestamp")]
    BadTimestamp(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldKind {
    Timestamp,
    Text,
    /// Text, upper-cased.
    Level,
    Number,
    /// Number in [0,1]; values above 1 are read as percentages.
    Fraction,
    /// Number in [0,100]; values above 100 are read as hundredths.
    Percent,
    /// Embedded JSON, possibly delivered as a string.
    Blob,
}

struct FieldSpec {
    name: &'static str,
    kind: FieldKind,
    required: bool,
}

const fn req(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: true }
}

const fn opt(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind, required: false }
}

const LOG_FIELDS: &[FieldSpec] = &[
    req("timestamp", FieldKind::Timestamp),
    req("message", FieldKind::Text),
    opt("level", FieldKind::Level),
    opt("process", FieldKind::Text),
    opt("host", FieldKind::Text),
    opt("metadata", FieldKind::Blob),
];

const ANOMALY_FIELDS: &[FieldSpec] = &[
    req("timestamp", FieldKind::Timestamp),
    req("score", FieldKind::Fraction),
    opt("severity", FieldKind::Text),
    opt("process", FieldKind::Text),
    opt("description", FieldKind::Text),
    opt("details", FieldKind::Blob),
];

const METRIC_FIELDS: &[FieldSpec] = &[
    req("timestamp", FieldKind::Timestamp),
    req("name", FieldKind::Text),
    req("value", FieldKind::Number),
    opt("unit", FieldKind::Text),
    opt("host", FieldKind::Text),
    opt("cpu_percent", FieldKind::Percent),
    opt("memory_percent", FieldKind::Percent),
    opt("labels", FieldKind::Blob),
];

fn field_specs(data_type: DataType) -> &'static [FieldSpec] {
    match data_type {
        DataType::Logs => LOG_FIELDS,
        DataType::Anomalies => ANOMALY_FIELDS,
        DataType::Metrics => METRIC_FIELDS,
    }
}

/// Cleans raw records for one export's set of requested types.
#[derive(Debug, Clone)]
pub struct Transformer {
    requested: Vec<DataType>,
}

/// Result of cleaning one batch.
#[derive(Debug, Default)]
pub struct CleanedBatch {
    pub records: Vec<ExportRecord>,
    pub dropped: u64,
}

impl Transformer {
    pub fn new(requested: &[DataType]) -> Self {
        Self {
            requested: requested.to_vec(),
        }
    }

    /// Clean a whole batch, dropping and logging rejected records.
    pub fn clean_batch(&self, raw: Vec<RawRecord>) -> CleanedBatch {
        let mut batch = CleanedBatch {
            records: Vec::with_capacity(raw.len()),
            dropped: 0,
        };
        for record in raw {
            match self.clean(record) {
                Ok(rec) => batch.records.push(rec),
                Err(reason) => {
                    warn!(reason = %reason, "Dropping malformed record");
                    batch.dropped += 1;
                }
            }
        }
        batch
    }

    /// Clean a single record.
    pub fn clean(&self, mut raw: RawRecord) -> Result<ExportRecord, RecordRejection> {
        let data_type = self.resolve_type(&mut raw)?;
        let mut record = ExportRecord::new(data_type);

        for spec in field_specs(data_type) {
            let value = match raw.remove(spec.name) {
                Some(Value::Null) | None => {
                    if spec.required {
                        return Err(RecordRejection::MissingField(spec.name));
                    }
                    continue;
                }
                Some(v) => v,
            };

            match normalize(spec, &value) {
                Ok(Normalized::Value(v)) => {
                    record.fields.insert(spec.name.to_string(), v);
                }
                Ok(Normalized::Unparsed(text)) => {
                    record.fields.insert(format!("{}_raw", spec.name), Value::String(text));
                    record.fields.insert(PARSE_ERROR_KEY.to_string(), Value::Bool(true));
                }
                Err(rejection) if spec.required => return Err(rejection),
                Err(_) => {
                    // Malformed optional field: keep it, just not as a known field.
                    record.extra.insert(spec.name.to_string(), value);
                }
            }
        }

        for (key, value) in raw {
            if !record.fields.contains_key(&key) {
                record.extra.insert(key, value);
                continue;
            }
            // Collides with a generated field such as `<blob>_raw`.
            let mut renamed = format!("{}_original", key);
            while record.fields.contains_key(&renamed) || record.extra.contains_key(&renamed) {
                renamed.push_str("_original");
            }
            warn!(
                record_type = %data_type,
                field = %key,
                kept_as = %renamed,
                "Raw field collides with a generated field, keeping it under another name"
            );
            record.extra.insert(renamed, value);
        }

        Ok(record)
    }

    fn resolve_type(&self, raw: &mut RawRecord) -> Result<DataType, RecordRejection> {
        let found = TYPE_KEYS.iter().find(|k| raw.contains_key(**k)).copied();

        let data_type = match found {
            Some(key) => {
                let tag = raw.remove(key).unwrap_or(Value::Null);
                match &tag {
                    Value::String(s) => s
                        .parse::<DataType>()
                        .map_err(|_| RecordRejection::UnknownType(s.clone()))?,
                    other => return Err(RecordRejection::UnknownType(other.to_string())),
                }
            }
            None => match self.requested.as_slice() {
                [only] => *only,
                _ => return Err(RecordRejection::MissingType),
            },
        };

        if !self.requested.contains(&data_type) {
            return Err(RecordRejection::NotRequested(data_type));
        }
        Ok(data_type)
    }
}

enum Normalized {
    Value(Value),
    /// A blob string that did not parse as JSON.
    Unparsed(String),
}

fn normalize(spec: &FieldSpec, value: &Value) -> Result<Normalized, RecordRejection> {
    let wrong = |expected| RecordRejection::WrongType {
        field: spec.name,
        expected,
    };

    match spec.kind {
        FieldKind::Timestamp => parse_timestamp(value)
            .map(|ts| Normalized::Value(Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))))
            .ok_or(RecordRejection::BadTimestamp(spec.name)),
        FieldKind::Text => match value {
            Value::String(_) => Ok(Normalized::Value(value.clone())),
            _ => Err(wrong("a string")),
        },
        FieldKind::Level => match value {
            Value::String(s) => Ok(Normalized::Value(Value::String(s.to_uppercase()))),
            _ => Err(wrong("a string")),
        },
        FieldKind::Number => match value.as_f64() {
            Some(f) if f.is_finite() => Ok(Normalized::Value(value.clone())),
            _ => Err(wrong("a finite number")),
        },
        FieldKind::Fraction => bounded(value, 1.0).ok_or_else(|| wrong("a finite number")),
        FieldKind::Percent => bounded(value, 100.0).ok_or_else(|| wrong("a finite number")),
        FieldKind::Blob => Ok(match value {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(parsed) => Normalized::Value(parsed),
                Err(_) => Normalized::Unparsed(text.clone()),
            },
            other => Normalized::Value(other.clone()),
        }),
    }
}

/// Rescale a bounded number: anything above `max` is divided by 100, then
/// the result is clamped into `[0, max]`.
fn bounded(value: &Value, max: f64) -> Option<Normalized> {
    let raw = value.as_f64().filter(|f| f.is_finite())?;
    let scaled = if raw > max { raw / 100.0 } else { raw }.clamp(0.0, max);
    if scaled == raw {
        return Some(Normalized::Value(value.clone()));
    }
    Number::from_f64(scaled).map(|n| Normalized::Value(Value::Number(n)))
}

/// Parse the timestamp shapes record sources are known to emit.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => {
            let f = n.as_f64().filter(|f| f.is_finite())?;
            if f.abs() > EPOCH_MILLIS_THRESHOLD {
                DateTime::from_timestamp_millis(f as i64)
            } else {
                let secs = f.floor();
                let nanos = ((f - secs) * 1e9).round().min(999_999_999.0) as u32;
                DateTime::from_timestamp(secs as i64, nanos)
            }
        }
        _ => None,
    }
}
