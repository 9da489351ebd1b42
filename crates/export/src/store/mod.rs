//! Job status store: TTL-bounded job metadata keyed by job id.
//!
//! Records live under `export:metadata:<job_id>` in a [`KvBackend`]. Every
//! [`StatusStore::put`] rewrites the whole record and resets its TTL, so jobs
//! age out even if the cleanup sweeper never runs.
//!
//! # Concurrency
//!
//! `put` is a read-merge-write with no locking, in-process or across
//! processes. Concurrent writers to the same job id race and the last write
//! wins. Callers must serialize their own writes per job; the pipeline does
//! this by giving each job exactly one writer (its runner task).

mod backend;
mod redis_backend;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::warn;

pub use self::backend::{KvBackend, MemoryBackend};
pub use self::redis_backend::RedisBackend;

use crate::error::StoreError;
use crate::types::{ExportJob, JobId};

/// Key namespace for job metadata.
pub const KEY_PREFIX: &str = "export:metadata:";

/// Fields that are only present for some states; a `put` without them clears them.
const OPTIONAL_FIELDS: &[&str] = &[
    "record_count",
    "dropped_count",
    "file_size",
    "file_path",
    "error_message",
    "completed_at",
];

pub fn key_for(job_id: JobId) -> String {
    format!("{}{}", KEY_PREFIX, job_id)
}

fn job_id_from_key(key: &str) -> Option<JobId> {
    key.strip_prefix(KEY_PREFIX)
        .and_then(|id| uuid::Uuid::parse_str(id).ok())
}

#[derive(Clone)]
pub struct StatusStore {
    backend: Arc<dyn KvBackend>,
    ttl: Duration,
}

impl StatusStore {
    pub fn new(backend: Arc<dyn KvBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Store over a fresh [`MemoryBackend`].
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), ttl)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replace the record for `job.job_id` and reset its TTL.
    ///
    /// The stored value is read first and `job` is merged over it: every
    /// field of [`ExportJob`] comes from `job`, while keys the store holds
    /// that `ExportJob` does not know about are carried forward.
    pub async fn put(&self, job: &ExportJob) -> Result<(), StoreError> {
        let key = key_for(job.job_id);

        let mut merged = match self.backend.get(&key).await? {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    warn!(key = %key, "Replacing unreadable status record");
                    Map::new()
                }
            },
            None => Map::new(),
        };
        for field in OPTIONAL_FIELDS {
            merged.remove(*field);
        }
        if let Value::Object(fresh) = serde_json::to_value(job)? {
            merged.extend(fresh);
        }

        let encoded = serde_json::to_string(&Value::Object(merged))?;
        self.backend.set_ex(&key, &encoded, self.ttl).await
    }

    /// Fetch a job record, `None` if absent or expired.
    pub async fn get(&self, job_id: JobId) -> Result<Option<ExportJob>, StoreError> {
        self.get_by_key(&key_for(job_id)).await
    }

    pub async fn exists(&self, job_id: JobId) -> Result<bool, StoreError> {
        Ok(self.backend.get(&key_for(job_id)).await?.is_some())
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<ExportJob>, StoreError> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };
        decode(key, &raw).map(Some)
    }

    /// Every readable record, newest first. Unreadable records are skipped.
    pub async fn list_all(&self) -> Result<Vec<ExportJob>, StoreError> {
        let keys = self.backend.keys(KEY_PREFIX).await?;
        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_by_key(&key).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(StoreError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Skipping corrupt status record");
                }
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// One page of records, newest first.
    ///
    /// Enumerates the whole key namespace on every call, which is fine for
    /// hundreds of jobs and not meant for more.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<ExportJob>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    /// Remove a job record. Deleting a missing record succeeds.
    pub async fn delete(&self, job_id: JobId) -> Result<(), StoreError> {
        self.backend.delete(&key_for(job_id)).await
    }
}

fn decode(key: &str, raw: &str) -> Result<ExportJob, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };

    let mut value: Value = serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
    let Value::Object(map) = &mut value else {
        return Err(corrupt("not a JSON object".into()));
    };
    if !map.contains_key("job_id") {
        let id = job_id_from_key(key).ok_or_else(|| corrupt("no job id in key".into()))?;
        map.insert("job_id".into(), Value::String(id.to_string()));
    }
    serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))
}
