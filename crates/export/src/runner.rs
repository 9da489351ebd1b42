//! Job runner: drives one export from first fetch to final artifact.
//!
//! [`JobRunner::run`] is the pipeline proper (fetch, clean, serialize) and
//! reports progress through a [`ProgressSink`]. [`JobRunner::execute`] wraps it
//! with the job lifecycle, writing `running` and then `completed` or `failed`
//! to the [`StatusStore`].
//!
//! A job deleted while it runs is told so through its [`CancelFlag`]. The
//! runner stops at the next batch boundary, removes anything it wrote and
//! leaves no status record behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::artifact;
use crate::error::{ExportError, StoreError};
use crate::record::ExportRecord;
use crate::serializer::{self, DocumentMeta};
use crate::source::{RecordQuery, RecordSource};
use crate::store::StatusStore;
use crate::transform::Transformer;
use crate::types::{ExportConfig, ExportJob, JobId, JobProgress, JobStatus};

/// Receives progress after every non-empty batch, in fetch order.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, job_id: JobId, progress: JobProgress) -> Result<(), StoreError>;

    /// Checked before every fetch and before the artifact is written.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Shared stop signal for one running job.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Final artifact path, `None` when no records survived.
    pub artifact: Option<PathBuf>,
    pub file_size: Option<u64>,
    pub record_count: u64,
    pub dropped_count: u64,
    pub processed: u64,
    pub total: Option<u64>,
}

#[derive(Clone)]
pub struct JobRunner {
    source: Arc<dyn RecordSource>,
    export_dir: PathBuf,
    file_prefix: String,
}

impl JobRunner {
    pub fn new(source: Arc<dyn RecordSource>, export_dir: impl Into<PathBuf>, file_prefix: impl Into<String>) -> Self {
        Self {
            source,
            export_dir: export_dir.into(),
            file_prefix: file_prefix.into(),
        }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub fn file_prefix(&self) -> &str {
        &self.file_prefix
    }

    /// Run the pipeline for an already-validated config.
    pub async fn run(
        &self,
        job_id: JobId,
        config: &ExportConfig,
        sink: &dyn ProgressSink,
    ) -> Result<RunOutcome, ExportError> {
        let query = RecordQuery::from(config);
        let transformer = Transformer::new(&config.data_types);
        let batch_size = config.batch_size.max(1);

        let total = self.source.count(&query).await?;

        let mut records: Vec<ExportRecord> = Vec::new();
        let mut processed: u64 = 0;
        let mut dropped: u64 = 0;
        let mut offset = 0usize;

        loop {
            if sink.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            let batch = self.source.fetch(&query, offset, batch_size).await?;
            let fetched = batch.len();
            if fetched == 0 {
                break;
            }
            offset += fetched;
            processed += fetched as u64;

            let cleaned = transformer.clean_batch(batch);
            dropped += cleaned.dropped;
            records.extend(cleaned.records);

            debug!(
                job_id = %job_id,
                fetched,
                processed,
                kept = records.len(),
                "Export batch processed"
            );
            if let Err(e) = sink.report(job_id, JobProgress::new(processed, total)).await {
                warn!(job_id = %job_id, error = %e, "Failed to record export progress");
            }

            if fetched < batch_size {
                break;
            }
        }

        let record_count = records.len() as u64;
        if records.is_empty() {
            info!(job_id = %job_id, processed, dropped, "No records to export");
            return Ok(RunOutcome {
                artifact: None,
                file_size: None,
                record_count,
                dropped_count: dropped,
                processed,
                total,
            });
        }

        if sink.is_cancelled() {
            return Err(ExportError::Cancelled);
        }
        let (path, size) = self.write(job_id, config, records).await?;
        Ok(RunOutcome {
            artifact: Some(path),
            file_size: Some(size),
            record_count,
            dropped_count: dropped,
            processed,
            total,
        })
    }

    async fn write(
        &self,
        job_id: JobId,
        config: &ExportConfig,
        records: Vec<ExportRecord>,
    ) -> Result<(PathBuf, u64), ExportError> {
        tokio::fs::create_dir_all(&self.export_dir).await?;

        let now = Utc::now();
        let dest = self.export_dir.join(artifact::file_name(
            &self.file_prefix,
            job_id,
            now,
            config.format,
            config.compress,
        ));
        let meta = DocumentMeta {
            exported_at: now,
            record_count: records.len(),
            format: config.format,
            data_types: config.data_types.clone(),
            job_id,
        };
        let format = config.format;
        let compress = config.compress;

        let target = dest.clone();
        let written = tokio::task::spawn_blocking(move || {
            serializer::write_artifact(&records, format, compress, &target, &meta)
        })
        .await;

        match written {
            Ok(Ok(size)) => Ok((dest, size)),
            Ok(Err(e)) => Err(e.into()),
            Err(join_err) => {
                let partial = artifact::partial_path(&dest);
                let _ = tokio::task::spawn_blocking(move || {
                    serializer::remove_if_exists(&partial);
                    serializer::remove_if_exists(&dest);
                })
                .await;
                Err(ExportError::Task(join_err.to_string()))
            }
        }
    }

    /// Drive a pending job to a terminal state, recording each transition.
    ///
    /// Store failures are logged, never propagated: the returned job is the
    /// final state even if it could not be persisted.
    ///
    /// Once `cancel` is set nothing more is written to the store. A write
    /// that raced the cancellation is undone, and so is the artifact. The
    /// returned job is then `failed` and exists only in memory.
    pub async fn execute(&self, mut job: ExportJob, store: &StatusStore, cancel: CancelFlag) -> ExportJob {
        let job_id = job.job_id;

        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        if let Err(e) = store.put(&job).await {
            warn!(job_id = %job_id, error = %e, "Failed to mark export job running");
        }
        info!(
            job_id = %job_id,
            format = %job.config.format,
            data_types = ?job.config.data_types,
            "Export job started"
        );

        let progress = StoreProgress::new(store.clone(), job.clone(), cancel.clone());
        let result = self.run(job_id, &job.config, &progress).await;
        let mut job = progress.into_job().await;

        if cancel.is_cancelled() {
            if let Ok(RunOutcome { artifact: Some(path), .. }) = &result {
                discard_artifact(job_id, path).await;
            }
            forget(store, job_id).await;
            info!(job_id = %job_id, "Export job cancelled");

            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.error_message = Some(ExportError::Cancelled.user_message());
            job.file_path = None;
            job.file_size = None;
            job.completed_at = Some(now);
            job.updated_at = now;
            return job;
        }

        let now = Utc::now();
        match result {
            Ok(outcome) => {
                job.status = JobStatus::Completed;
                job.progress = JobProgress::new(
                    outcome.processed,
                    Some(outcome.total.unwrap_or(outcome.processed)),
                );
                job.record_count = Some(outcome.record_count);
                job.dropped_count = Some(outcome.dropped_count);
                job.file_size = outcome.file_size;
                job.file_path = outcome.artifact;
                job.error_message = None;
                job.completed_at = Some(now);
                info!(
                    job_id = %job_id,
                    records = outcome.record_count,
                    dropped = outcome.dropped_count,
                    path = ?job.file_path,
                    "Export job completed"
                );
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(e.user_message());
                job.file_path = None;
                job.file_size = None;
                job.completed_at = Some(now);
                error!(job_id = %job_id, error = %e, "Export job failed");
            }
        }
        job.updated_at = now;

        if let Err(e) = store.put(&job).await {
            error!(job_id = %job_id, error = %e, "Failed to record final export job state");
        }
        if cancel.is_cancelled() {
            if let Some(path) = job.file_path.take() {
                discard_artifact(job_id, &path).await;
            }
            forget(store, job_id).await;
            info!(job_id = %job_id, "Export job deleted as it finished");
            job.status = JobStatus::Failed;
            job.error_message = Some(ExportError::Cancelled.user_message());
            job.file_size = None;
        }
        job
    }
}

async fn discard_artifact(job_id: JobId, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(job_id = %job_id, path = %path.display(), "Removed artifact of deleted export job"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to remove artifact of deleted export job"),
    }
}

async fn forget(store: &StatusStore, job_id: JobId) {
    if let Err(e) = store.delete(job_id).await {
        warn!(job_id = %job_id, error = %e, "Failed to remove status of deleted export job");
    }
}

/// Progress sink that keeps the job record current in the status store.
struct StoreProgress {
    store: StatusStore,
    job: Mutex<ExportJob>,
    cancel: CancelFlag,
}

impl StoreProgress {
    fn new(store: StatusStore, job: ExportJob, cancel: CancelFlag) -> Self {
        Self {
            store,
            job: Mutex::new(job),
            cancel,
        }
    }

    async fn into_job(self) -> ExportJob {
        self.job.into_inner()
    }
}

#[async_trait]
impl ProgressSink for StoreProgress {
    async fn report(&self, job_id: JobId, progress: JobProgress) -> Result<(), StoreError> {
        let mut job = self.job.lock().await;
        job.progress = progress;
        job.updated_at = Utc::now();
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.store.put(&job).await?;
        // The delete may have landed between the check and the put.
        if self.cancel.is_cancelled() {
            self.store.delete(job_id).await?;
        }
        Ok(())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
