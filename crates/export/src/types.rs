//! Request, job and progress types shared by every pipeline stage.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ExportError;

pub type JobId = Uuid;

// ── Record types ─────────────────────────────────────────────────────

/// Record-type tags an export may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Logs,
    Anomalies,
    Metrics,
}

impl DataType {
    pub const ALL: [DataType; 3] = [DataType::Logs, DataType::Anomalies, DataType::Metrics];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Logs => "logs",
            DataType::Anomalies => "anomalies",
            DataType::Metrics => "metrics",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logs" | "log" => Ok(DataType::Logs),
            "anomalies" | "anomaly" => Ok(DataType::Anomalies),
            "metrics" | "metric" => Ok(DataType::Metrics),
            other => Err(ExportError::InvalidConfig(format!(
                "unknown data type '{}' (supported: logs, anomalies, metrics)",
                other
            ))),
        }
    }
}

// ── Output format ────────────────────────────────────────────────────

/// Artifact format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Single JSON document: metadata header plus a `data` array.
    #[default]
    Json,
    /// CSV with a header row built from the union of record keys.
    Csv,
    /// Zip container holding both the JSON and CSV renderings.
    Zip,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Zip => "zip",
        }
    }

    /// File extension, accounting for gzip on the single-file formats.
    pub fn extension(&self, compress: bool) -> &'static str {
        match (self, compress) {
            (ExportFormat::Json, false) => "json",
            (ExportFormat::Json, true) => "json.gz",
            (ExportFormat::Csv, false) => "csv",
            (ExportFormat::Csv, true) => "csv.gz",
            (ExportFormat::Zip, _) => "zip",
        }
    }

    pub fn content_type(&self, compress: bool) -> &'static str {
        match (self, compress) {
            (ExportFormat::Zip, _) => "application/zip",
            (_, true) => "application/gzip",
            (ExportFormat::Json, false) => "application/json",
            (ExportFormat::Csv, false) => "text/csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Export request ───────────────────────────────────────────────────

fn default_batch_size() -> usize {
    stupid_core::config::DEFAULT_BATCH_SIZE
}

/// What to export. Immutable once a job has been submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    pub data_types: Vec<DataType>,
    /// Field equality filters, applied by the record source.
    #[serde(default)]
    pub filters: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default)]
    pub compress: bool,
    /// Restrict to records whose `process` field is one of these.
    #[serde(default)]
    pub process_filter: Option<Vec<String>>,
}

impl ExportConfig {
    /// Config exporting the given types with every other field defaulted.
    pub fn for_types(data_types: Vec<DataType>) -> Self {
        Self {
            start_date: None,
            end_date: None,
            data_types,
            filters: None,
            batch_size: default_batch_size(),
            format: ExportFormat::default(),
            compress: false,
            process_filter: None,
        }
    }

    /// Check the config and return it with duplicate data types collapsed.
    ///
    /// This is the only validation performed; the runner trusts its input.
    pub fn validated(mut self, max_batch_size: usize) -> Result<Self, ExportError> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end <= start {
                return Err(ExportError::InvalidConfig(format!(
                    "end_date ({}) must be after start_date ({})",
                    end.to_rfc3339(),
                    start.to_rfc3339()
                )));
            }
        }

        if self.data_types.is_empty() {
            return Err(ExportError::InvalidConfig(
                "data_types must contain at least one of: logs, anomalies, metrics".into(),
            ));
        }
        let mut seen = Vec::with_capacity(self.data_types.len());
        self.data_types.retain(|t| {
            if seen.contains(t) {
                false
            } else {
                seen.push(*t);
                true
            }
        });

        if self.batch_size == 0 || self.batch_size > max_batch_size {
            return Err(ExportError::InvalidConfig(format!(
                "batch_size must be between 1 and {}",
                max_batch_size
            )));
        }

        if let Some(processes) = &self.process_filter {
            if processes.iter().any(|p| p.trim().is_empty()) {
                return Err(ExportError::InvalidConfig(
                    "process_filter entries must be non-empty".into(),
                ));
            }
        }

        Ok(self)
    }

    /// Parse and validate a raw JSON request body.
    pub fn from_json(value: serde_json::Value, max_batch_size: usize) -> Result<Self, ExportError> {
        let config: ExportConfig = serde_json::from_value(value)
            .map_err(|e| ExportError::InvalidConfig(e.to_string()))?;
        config.validated(max_batch_size)
    }
}

// ── Job tracking ─────────────────────────────────────────────────────

/// Lifecycle of an export job. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot written after every batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    /// Raw records fetched and processed so far.
    pub processed: u64,
    /// Total records in range, when the source can count them.
    pub total: Option<u64>,
    pub percentage: Option<f64>,
}

impl JobProgress {
    pub fn new(processed: u64, total: Option<u64>) -> Self {
        let percentage = total.map(|t| {
            if t > 0 {
                (processed as f64 / t as f64 * 100.0).min(100.0)
            } else {
                100.0
            }
        });
        Self {
            processed,
            total,
            percentage,
        }
    }
}

/// Status record for one export job, as held in the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config: ExportConfig,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    /// A freshly submitted job.
    pub fn pending(job_id: JobId, config: ExportConfig) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            config,
            progress: JobProgress::default(),
            record_count: None,
            dropped_count: None,
            file_size: None,
            file_path: None,
            error_message: None,
            completed_at: None,
        }
    }
}
