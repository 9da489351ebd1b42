//! Export service: job submission, status queries, deletion and the table
//! of running job tasks.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use stupid_core::config::ExportSettings;

use crate::error::{ExportError, ExportResult};
use crate::runner::{CancelFlag, JobRunner};
use crate::source::RecordSource;
use crate::store::StatusStore;
use crate::sweeper::{CleanupReport, CleanupSweeper};
use crate::types::{ExportConfig, ExportFormat, ExportJob, JobId, JobProgress, JobStatus};

/// Attempts at minting an unused job id before giving up.
pub const MAX_ID_ATTEMPTS: usize = 5;

type IdGenerator = Box<dyn Fn() -> JobId + Send + Sync>;

/// Progress view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: JobProgress,
}

/// Where a job's artifact stands, for a delivery layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactLookup {
    UnknownJob,
    /// The job has not completed (or failed).
    NotReady(JobStatus),
    /// Completed without producing a file (zero records).
    NoArtifact,
    /// Metadata points at a file that is gone.
    Missing(PathBuf),
    Ready {
        path: PathBuf,
        format: ExportFormat,
        compress: bool,
    },
}

/// A spawned job and the flag that stops it.
struct JobTask {
    handle: JoinHandle<ExportJob>,
    cancel: CancelFlag,
}

pub struct ExportService {
    runner: JobRunner,
    store: StatusStore,
    sweeper: CleanupSweeper,
    max_batch_size: usize,
    default_batch_size: usize,
    jobs: Mutex<HashMap<JobId, JobTask>>,
    id_generator: IdGenerator,
}

impl ExportService {
    pub fn new(runner: JobRunner, store: StatusStore, sweeper: CleanupSweeper, max_batch_size: usize) -> Self {
        Self {
            runner,
            store,
            sweeper,
            max_batch_size,
            default_batch_size: stupid_core::config::DEFAULT_BATCH_SIZE.min(max_batch_size),
            jobs: Mutex::new(HashMap::new()),
            id_generator: Box::new(Uuid::new_v4),
        }
    }

    /// Wire runner and sweeper from the export settings.
    pub fn from_settings(source: Arc<dyn RecordSource>, store: StatusStore, settings: &ExportSettings) -> Self {
        let runner = JobRunner::new(source, &settings.export_dir, &settings.file_prefix);
        let sweeper = CleanupSweeper::new(
            store.clone(),
            &settings.export_dir,
            settings.retention(),
            settings.cleanup_interval(),
            settings.cleanup_retry(),
        );
        let mut service = Self::new(runner, store, sweeper, settings.max_batch_size);
        service.default_batch_size = settings.default_batch_size;
        service
    }

    /// Replace the job-id generator.
    pub fn with_id_generator(mut self, generator: impl Fn() -> JobId + Send + Sync + 'static) -> Self {
        self.id_generator = Box::new(generator);
        self
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    pub fn sweeper(&self) -> &CleanupSweeper {
        &self.sweeper
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Validate `config`, record a pending job and schedule it.
    ///
    /// Returns as soon as the job is scheduled; the export runs in the
    /// background.
    pub async fn submit(&self, config: ExportConfig) -> ExportResult<ExportJob> {
        let config = config.validated(self.max_batch_size)?;

        let mut jobs = self.jobs.lock().await;
        let job_id = self.mint_job_id(&jobs).await?;
        let job = ExportJob::pending(job_id, config);
        self.store.put(&job).await?;

        let runner = self.runner.clone();
        let store = self.store.clone();
        let task_job = job.clone();
        let cancel = CancelFlag::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { runner.execute(task_job, &store, task_cancel).await });
        jobs.insert(job_id, JobTask { handle, cancel });

        info!(
            job_id = %job_id,
            format = %job.config.format,
            batch_size = job.config.batch_size,
            "Export job submitted"
        );
        Ok(job)
    }

    /// Parse a raw request body and submit it. A body without `batch_size`
    /// gets the configured default.
    pub async fn submit_json(&self, mut body: serde_json::Value) -> ExportResult<ExportJob> {
        if let serde_json::Value::Object(map) = &mut body {
            map.entry("batch_size")
                .or_insert_with(|| serde_json::Value::from(self.default_batch_size));
        }
        let config = ExportConfig::from_json(body, self.max_batch_size)?;
        self.submit(config).await
    }

    async fn mint_job_id(&self, running: &HashMap<JobId, JobTask>) -> ExportResult<JobId> {
        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = (self.id_generator)();
            if !running.contains_key(&id) && !self.store.exists(id).await? {
                return Ok(id);
            }
            warn!(job_id = %id, attempt, "Job id already in use, regenerating");
        }
        Err(ExportError::JobIdCollision(MAX_ID_ATTEMPTS))
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_status(&self, job_id: JobId) -> ExportResult<Option<ExportJob>> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn list_jobs(&self, limit: usize, offset: usize) -> ExportResult<Vec<ExportJob>> {
        Ok(self.store.list(limit, offset).await?)
    }

    pub async fn get_progress(&self, job_id: JobId) -> ExportResult<Option<ProgressReport>> {
        Ok(self.store.get(job_id).await?.map(|job| ProgressReport {
            job_id: job.job_id,
            status: job.status,
            progress: job.progress,
        }))
    }

    /// Resolve a job's artifact for download.
    pub async fn artifact(&self, job_id: JobId) -> ExportResult<ArtifactLookup> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(ArtifactLookup::UnknownJob);
        };
        if job.status != JobStatus::Completed {
            return Ok(ArtifactLookup::NotReady(job.status));
        }
        let Some(path) = job.file_path else {
            return Ok(ArtifactLookup::NoArtifact);
        };
        let present = tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file());
        if !present {
            return Ok(ArtifactLookup::Missing(path));
        }
        Ok(ArtifactLookup::Ready {
            path,
            format: job.config.format,
            compress: job.config.compress,
        })
    }

    // ── Deletion ────────────────────────────────────────────────────

    /// Remove a job's artifact and metadata. Deleting twice is fine.
    ///
    /// A job that is still running is cancelled first. It stops at its next
    /// batch, discards anything it wrote and never recreates the record.
    pub async fn delete(&self, job_id: JobId) -> ExportResult<()> {
        if let Some(task) = self.jobs.lock().await.get(&job_id) {
            if !task.handle.is_finished() {
                info!(job_id = %job_id, "Cancelling running export job");
            }
            task.cancel.cancel();
        }

        if let Some(job) = self.store.get(job_id).await? {
            if let Some(path) = &job.file_path {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => info!(job_id = %job_id, path = %path.display(), "Deleted export artifact"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.store.delete(job_id).await?;
        Ok(())
    }

    // ── Job table ───────────────────────────────────────────────────

    /// Number of job tasks still running.
    pub async fn active_jobs(&self) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Await a job's task and return its final state.
    ///
    /// Returns `Ok(None)` when this service has no task for `job_id`.
    pub async fn wait(&self, job_id: JobId) -> ExportResult<Option<ExportJob>> {
        let task = self.jobs.lock().await.remove(&job_id);
        match task {
            Some(task) => self.join(job_id, task.handle).await.map(Some),
            None => Ok(None),
        }
    }

    /// Drop handles of finished tasks. Returns how many were reaped.
    pub async fn reap_finished(&self) -> usize {
        let finished: Vec<(JobId, JoinHandle<ExportJob>)> = {
            let mut jobs = self.jobs.lock().await;
            let ids: Vec<JobId> = jobs
                .iter()
                .filter(|(_, t)| t.handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| jobs.remove(&id).map(|t| (id, t.handle)))
                .collect()
        };

        let count = finished.len();
        for (job_id, handle) in finished {
            let _ = self.join(job_id, handle).await;
        }
        count
    }

    /// Join a task; a panicked task has its job marked failed.
    async fn join(&self, job_id: JobId, handle: JoinHandle<ExportJob>) -> ExportResult<ExportJob> {
        match handle.await {
            Ok(job) => Ok(job),
            Err(join_err) => {
                error!(job_id = %job_id, error = %join_err, "Export task aborted");
                let err = ExportError::Task(join_err.to_string());
                if let Some(mut job) = self.store.get(job_id).await? {
                    if !job.status.is_terminal() {
                        let now = Utc::now();
                        job.status = JobStatus::Failed;
                        job.error_message = Some(err.user_message());
                        job.updated_at = now;
                        job.completed_at = Some(now);
                        self.store.put(&job).await?;
                    }
                }
                Err(err)
            }
        }
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Run one cleanup sweep now.
    pub async fn run_cleanup(&self) -> ExportResult<CleanupReport> {
        self.sweeper.run_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::record::RawRecord;
    use crate::source::{RecordQuery, StaticRecordSource};
    use crate::types::DataType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn logs(n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| {
                json!({"timestamp": 1_700_000_000 + i as i64, "message": "m"})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    fn service(dir: &TempDir, records: Vec<RawRecord>) -> ExportService {
        let settings = ExportSettings {
            export_dir: dir.path().join("exports"),
            ..ExportSettings::default()
        };
        ExportService::from_settings(
            Arc::new(StaticRecordSource::new(records)),
            StatusStore::in_memory(Duration::from_secs(3600)),
            &settings,
        )
    }

    #[tokio::test]
    async fn submit_returns_pending_and_job_completes() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, logs(5));

        let job = svc
            .submit(ExportConfig::for_types(vec![DataType::Logs]))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let done = svc.wait(job.job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(svc.get_status(job.job_id).await.unwrap().unwrap().record_count, Some(5));
        assert_eq!(svc.active_jobs().await, 0);
    }

    #[tokio::test]
    async fn json_body_gets_configured_batch_size() {
        let dir = TempDir::new().unwrap();
        let settings = ExportSettings {
            export_dir: dir.path().to_path_buf(),
            default_batch_size: 250,
            ..ExportSettings::default()
        };
        let svc = ExportService::from_settings(
            Arc::new(StaticRecordSource::new(vec![])),
            StatusStore::in_memory(Duration::from_secs(60)),
            &settings,
        );

        let job = svc.submit_json(json!({"data_types": ["logs"]})).await.unwrap();
        assert_eq!(job.config.batch_size, 250);

        let job = svc
            .submit_json(json!({"data_types": ["logs"], "batch_size": 7}))
            .await
            .unwrap();
        assert_eq!(job.config.batch_size, 7);
    }

    #[tokio::test]
    async fn invalid_config_creates_no_job() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, logs(1));

        let err = svc
            .submit_json(json!({"data_types": ["logs"], "batch_size": 0}))
            .await
            .unwrap_err();

        assert!(err.is_client_error());
        assert!(svc.list_jobs(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn colliding_ids_are_regenerated() {
        let dir = TempDir::new().unwrap();
        let taken = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = service(&dir, vec![]).with_id_generator(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                taken
            } else {
                fresh
            }
        });
        svc.store()
            .put(&ExportJob::pending(taken, ExportConfig::for_types(vec![DataType::Logs])))
            .await
            .unwrap();

        let job = svc
            .submit(ExportConfig::for_types(vec![DataType::Logs]))
            .await
            .unwrap();

        assert_eq!(job.job_id, fresh);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_collision_is_an_error() {
        let dir = TempDir::new().unwrap();
        let taken = Uuid::new_v4();
        let svc = service(&dir, vec![]).with_id_generator(move || taken);
        let original = ExportJob::pending(taken, ExportConfig::for_types(vec![DataType::Logs]));
        svc.store().put(&original).await.unwrap();

        let err = svc
            .submit(ExportConfig::for_types(vec![DataType::Metrics]))
            .await
            .unwrap_err();

        assert!(matches!(err, ExportError::JobIdCollision(MAX_ID_ATTEMPTS)));
        assert_eq!(svc.get_status(taken).await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn delete_removes_artifact_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, logs(3));
        let job = svc
            .submit(ExportConfig::for_types(vec![DataType::Logs]))
            .await
            .unwrap();
        let done = svc.wait(job.job_id).await.unwrap().unwrap();
        let path = done.file_path.unwrap();
        assert!(path.exists());

        svc.delete(job.job_id).await.unwrap();
        svc.delete(job.job_id).await.unwrap();

        assert!(!path.exists());
        assert_eq!(svc.get_status(job.job_id).await.unwrap(), None);
        assert_eq!(svc.artifact(job.job_id).await.unwrap(), ArtifactLookup::UnknownJob);
    }

    struct SlowSource {
        inner: StaticRecordSource,
        delay: Duration,
    }

    #[async_trait]
    impl RecordSource for SlowSource {
        async fn fetch(
            &self,
            query: &RecordQuery,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<RawRecord>, SourceError> {
            tokio::time::sleep(self.delay).await;
            self.inner.fetch(query, offset, limit).await
        }
    }

    #[tokio::test]
    async fn deleting_a_running_job_keeps_it_deleted() {
        let dir = TempDir::new().unwrap();
        let export_dir = dir.path().join("exports");
        let settings = ExportSettings {
            export_dir: export_dir.clone(),
            ..ExportSettings::default()
        };
        let source = SlowSource {
            inner: StaticRecordSource::new(logs(5)),
            delay: Duration::from_millis(100),
        };
        let svc = ExportService::from_settings(
            Arc::new(source),
            StatusStore::in_memory(Duration::from_secs(3600)),
            &settings,
        );
        let mut config = ExportConfig::for_types(vec![DataType::Logs]);
        config.batch_size = 2;

        let job = svc.submit(config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        svc.delete(job.job_id).await.unwrap();
        assert_eq!(svc.get_status(job.job_id).await.unwrap(), None);

        let done = svc.wait(job.job_id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.file_path.is_none());
        assert_eq!(svc.get_status(job.job_id).await.unwrap(), None);

        let report = svc.run_cleanup().await.unwrap();
        assert_eq!(report.deleted_metadata, 0);
        assert_eq!(svc.get_status(job.job_id).await.unwrap(), None);
        let leftovers = fs::read_dir(&export_dir).map(|entries| entries.count()).unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn artifact_lookup_states() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, logs(2));

        let pending = ExportJob::pending(Uuid::new_v4(), ExportConfig::for_types(vec![DataType::Logs]));
        svc.store().put(&pending).await.unwrap();
        assert_eq!(
            svc.artifact(pending.job_id).await.unwrap(),
            ArtifactLookup::NotReady(JobStatus::Pending)
        );

        let job = svc
            .submit(ExportConfig::for_types(vec![DataType::Logs]))
            .await
            .unwrap();
        svc.wait(job.job_id).await.unwrap();
        let ArtifactLookup::Ready { path, format, .. } = svc.artifact(job.job_id).await.unwrap() else {
            panic!("expected a ready artifact");
        };
        assert_eq!(format, ExportFormat::Json);

        fs::remove_file(&path).unwrap();
        assert_eq!(svc.artifact(job.job_id).await.unwrap(), ArtifactLookup::Missing(path));
    }

    #[tokio::test]
    async fn reap_finished_drops_completed_handles() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, logs(1));
        let job = svc
            .submit(ExportConfig::for_types(vec![DataType::Logs]))
            .await
            .unwrap();

        for _ in 0..100 {
            if svc.active_jobs().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(svc.reap_finished().await, 1);
        assert_eq!(svc.wait(job.job_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn progress_view() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, logs(4));
        let job = svc
            .submit(ExportConfig::for_types(vec![DataType::Logs]))
            .await
            .unwrap();
        svc.wait(job.job_id).await.unwrap();

        let report = svc.get_progress(job.job_id).await.unwrap().unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.progress.processed, 4);
        assert!(svc.get_progress(Uuid::new_v4()).await.unwrap().is_none());
    }
}
