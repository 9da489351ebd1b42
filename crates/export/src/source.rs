//! The record-source seam: where raw records come from.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::SourceError;
use crate::record::RawRecord;
use crate::transform::parse_timestamp;
use crate::types::{DataType, ExportConfig};

/// The slice of data an export asks its source for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordQuery {
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end: Option<DateTime<Utc>>,
    pub data_types: Vec<DataType>,
    pub filters: BTreeMap<String, Value>,
    pub processes: Option<Vec<String>>,
}

impl From<&ExportConfig> for RecordQuery {
    fn from(config: &ExportConfig) -> Self {
        Self {
            start: config.start_date,
            end: config.end_date,
            data_types: config.data_types.clone(),
            filters: config.filters.clone().unwrap_or_default(),
            processes: config.process_filter.clone(),
        }
    }
}

impl RecordQuery {
    /// Whether a raw record falls inside this query.
    ///
    /// Records whose type or timestamp cannot be read are let through; the
    /// transformer decides what to do with them.
    pub fn matches(&self, record: &RawRecord) -> bool {
        let tag = ["record_type", "type", "data_type"]
            .iter()
            .find_map(|k| record.get(*k))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<DataType>().ok());
        if let Some(tag) = tag {
            if !self.data_types.contains(&tag) {
                return false;
            }
        }

        if self.start.is_some() || self.end.is_some() {
            if let Some(ts) = record.get("timestamp").and_then(parse_timestamp) {
                if self.start.is_some_and(|start| ts < start) {
                    return false;
                }
                if self.end.is_some_and(|end| ts >= end) {
                    return false;
                }
            }
        }

        if let Some(processes) = &self.processes {
            let process = record.get("process").and_then(Value::as_str);
            if !process.is_some_and(|p| processes.iter().any(|want| want == p)) {
                return false;
            }
        }

        self.filters
            .iter()
            .all(|(key, want)| record.get(key) == Some(want))
    }
}

/// Supplies raw records to the job runner.
///
/// `fetch` is called with increasing offsets until it returns fewer than
/// `limit` records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(
        &self,
        query: &RecordQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError>;

    /// Total matching records, if the source can tell cheaply.
    async fn count(&self, _query: &RecordQuery) -> Result<Option<u64>, SourceError> {
        Ok(None)
    }
}

/// A source over an in-memory record set.
#[derive(Debug, Clone, Default)]
pub struct StaticRecordSource {
    records: Vec<RawRecord>,
}

impl StaticRecordSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    fn matching<'a>(&'a self, query: &'a RecordQuery) -> impl Iterator<Item = &'a RawRecord> + 'a {
        self.records.iter().filter(move |r| query.matches(r))
    }
}

#[async_trait]
impl RecordSource for StaticRecordSource {
    async fn fetch(
        &self,
        query: &RecordQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        Ok(self.matching(query).skip(offset).take(limit).cloned().collect())
    }

    async fn count(&self, query: &RecordQuery) -> Result<Option<u64>, SourceError> {
        Ok(Some(self.matching(query).count() as u64))
    }
}
