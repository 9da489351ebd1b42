//! Cleanup sweeper: expires old artifacts and reconciles orphaned metadata.
//!
//! Each run makes two independent passes:
//!
//! 1. **Age**: every file in the export directory older than the retention
//!    window is deleted, together with the status record of the job named in
//!    its file name. Files whose name does not parse are deleted anyway.
//! 2. **Orphans**: every completed job whose artifact path no longer exists
//!    has its status record deleted.
//!
//! Per-item failures are collected in the [`CleanupReport`]; only failing to
//! enumerate the export directory or the status store fails a run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::artifact;
use crate::error::{ExportError, ExportResult};
use crate::store::StatusStore;
use crate::types::{JobId, JobStatus};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub deleted_files: usize,
    pub deleted_metadata: usize,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct CleanupSweeper {
    store: StatusStore,
    export_dir: PathBuf,
    retention: Duration,
    interval: Duration,
    retry: Duration,
}

impl CleanupSweeper {
    pub fn new(
        store: StatusStore,
        export_dir: impl Into<PathBuf>,
        retention: Duration,
        interval: Duration,
        retry: Duration,
    ) -> Self {
        Self {
            store,
            export_dir: export_dir.into(),
            retention,
            interval,
            retry,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn run_once(&self) -> ExportResult<CleanupReport> {
        self.run_once_at(SystemTime::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn run_once_at(&self, now: SystemTime) -> ExportResult<CleanupReport> {
        let mut report = CleanupReport::default();
        self.expire_artifacts(now, &mut report).await?;
        self.reconcile_orphans(&mut report).await?;

        info!(
            deleted_files = report.deleted_files,
            deleted_metadata = report.deleted_metadata,
            errors = report.errors.len(),
            "Export cleanup finished"
        );
        Ok(report)
    }

    async fn expire_artifacts(&self, now: SystemTime, report: &mut CleanupReport) -> ExportResult<()> {
        let dir = self.export_dir.clone();
        let retention = self.retention;
        let scan = tokio::task::spawn_blocking(move || remove_expired_files(&dir, now, retention))
            .await
            .map_err(|e| ExportError::Task(e.to_string()))??;

        report.deleted_files += scan.deleted_files;
        report.errors.extend(scan.errors);
        for name in scan.expired {
            match artifact::parse_job_id(&name) {
                Some(job_id) => self.delete_metadata(job_id, report).await,
                None => warn!(file = %name, "Deleted expired file with unrecognized name"),
            }
        }
        Ok(())
    }

    async fn reconcile_orphans(&self, report: &mut CleanupReport) -> ExportResult<()> {
        for job in self.store.list_all().await? {
            if job.status != JobStatus::Completed {
                continue;
            }
            let Some(path) = &job.file_path else {
                continue;
            };
            // An unreadable path counts as present.
            if tokio::fs::try_exists(path).await.unwrap_or(true) {
                continue;
            }
            info!(job_id = %job.job_id, path = %path.display(), "Removing metadata for missing artifact");
            self.delete_metadata(job.job_id, report).await;
        }
        Ok(())
    }

    async fn delete_metadata(&self, job_id: JobId, report: &mut CleanupReport) {
        let existed = match self.store.exists(job_id).await {
            Ok(existed) => existed,
            Err(e) => {
                report.errors.push(format!("{}: {}", job_id, e));
                return;
            }
        };
        if !existed {
            return;
        }
        match self.store.delete(job_id).await {
            Ok(()) => report.deleted_metadata += 1,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to delete export metadata");
                report.errors.push(format!("{}: {}", job_id, e));
            }
        }
    }

    /// Sweep on the configured interval until `shutdown` is notified.
    ///
    /// A failed run is retried after the shorter retry interval.
    pub async fn run_forever(self, shutdown: Arc<Notify>) {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Export cleanup sweeper started"
        );
        loop {
            let next = match self.run_once().await {
                Ok(_) => self.interval,
                Err(e) => {
                    error!(
                        error = %e,
                        retry_secs = self.retry.as_secs(),
                        "Export cleanup run failed"
                    );
                    self.retry
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(next) => {}
                _ = shutdown.notified() => {
                    info!("Export cleanup sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// Outcome of one directory pass.
#[derive(Debug, Default)]
struct ExpiredScan {
    deleted_files: usize,
    /// Names of expired files, including ones already gone.
    expired: Vec<String>,
    errors: Vec<String>,
}

/// Delete every regular file in `dir` older than `retention`.
///
/// A missing directory is an empty pass; any other failure to list it is
/// returned.
fn remove_expired_files(dir: &Path, now: SystemTime, retention: Duration) -> io::Result<ExpiredScan> {
    let mut scan = ExpiredScan::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Export directory does not exist yet");
            return Ok(scan);
        }
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                scan.errors.push(format!("read_dir entry: {}", e));
                continue;
            }
        };
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        let modified = match entry.metadata().and_then(|m| {
            if m.is_file() {
                m.modified().map(Some)
            } else {
                Ok(None)
            }
        }) {
            Ok(Some(modified)) => modified,
            Ok(None) => continue,
            Err(e) => {
                warn!(file = %name, error = %e, "Failed to stat export file");
                scan.errors.push(format!("{}: {}", name, e));
                continue;
            }
        };

        // A timestamp in the future reads as age zero.
        let age = now.duration_since(modified).unwrap_or_default();
        if age <= retention {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                if artifact::is_partial(&path) {
                    debug!(file = %name, "Deleted stale partial export");
                }
                scan.deleted_files += 1;
                scan.expired.push(name);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => scan.expired.push(name),
            Err(e) => {
                warn!(file = %name, error = %e, "Failed to delete expired export");
                scan.errors.push(format!("{}: {}", name, e));
            }
        }
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{key_for, KvBackend, MemoryBackend};
    use crate::types::{DataType, ExportConfig, ExportFormat, ExportJob};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::fs::File;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;
    use uuid::Uuid;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn sweeper(dir: &TempDir, store: &StatusStore) -> CleanupSweeper {
        CleanupSweeper::new(store.clone(), dir.path(), 7 * DAY, DAY, Duration::from_secs(60))
    }

    fn touch(dir: &TempDir, name: &str, mtime: SystemTime) -> PathBuf {
        let path = dir.path().join(name);
        let file = File::create(&path).unwrap();
        file.set_modified(mtime).unwrap();
        path
    }

    fn completed(job_id: JobId, path: PathBuf) -> ExportJob {
        let mut job = ExportJob::pending(job_id, ExportConfig::for_types(vec![DataType::Logs]));
        job.status = JobStatus::Completed;
        job.file_path = Some(path);
        job.completed_at = Some(Utc::now());
        job
    }

    #[tokio::test]
    async fn missing_export_dir_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::in_memory(DAY);
        let sweeper = CleanupSweeper::new(store, dir.path().join("absent"), DAY, DAY, DAY);
        assert_eq!(sweeper.run_once().await.unwrap(), CleanupReport::default());
    }

    #[tokio::test]
    async fn expired_artifact_and_metadata_deleted() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::in_memory(30 * DAY);
        let now = SystemTime::now();
        let id = Uuid::new_v4();
        let name = artifact::file_name("export", id, Utc::now(), ExportFormat::Json, false);
        let path = touch(&dir, &name, now - 8 * DAY);
        store.put(&completed(id, path.clone())).await.unwrap();

        let report = sweeper(&dir, &store).run_once_at(now).await.unwrap();

        assert_eq!(report.deleted_files, 1);
        assert_eq!(report.deleted_metadata, 1);
        assert!(report.errors.is_empty());
        assert!(!path.exists());
        assert_eq!(store.get(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unparsable_and_partial_files_deleted_when_old() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::in_memory(DAY);
        let now = SystemTime::now();
        let junk = touch(&dir, "notes.txt", now - 30 * DAY);
        let partial = touch(
            &dir,
            &format!("export_{}_20240101T000000.json.partial", Uuid::new_v4()),
            now - 30 * DAY,
        );

        let report = sweeper(&dir, &store).run_once_at(now).await.unwrap();

        assert_eq!(report.deleted_files, 2);
        assert_eq!(report.deleted_metadata, 0);
        assert!(!junk.exists());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn fresh_files_and_subdirectories_untouched() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::in_memory(DAY);
        let now = SystemTime::now();
        let fresh = touch(&dir, "export_x_20240101T000000.json", now - DAY);
        fs::create_dir(dir.path().join("nested")).unwrap();

        let report = sweeper(&dir, &store).run_once_at(now).await.unwrap();

        assert_eq!(report, CleanupReport::default());
        assert!(fresh.exists());
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn orphaned_metadata_deleted_regardless_of_age() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::in_memory(DAY);
        let gone = Uuid::new_v4();
        store
            .put(&completed(gone, dir.path().join("export_gone.json")))
            .await
            .unwrap();
        let kept = Uuid::new_v4();
        let path = touch(&dir, "export_kept.json", SystemTime::now());
        store.put(&completed(kept, path)).await.unwrap();
        let running = ExportJob::pending(Uuid::new_v4(), ExportConfig::for_types(vec![DataType::Logs]));
        store.put(&running).await.unwrap();

        let report = sweeper(&dir, &store).run_once().await.unwrap();

        assert_eq!(report.deleted_metadata, 1);
        assert_eq!(store.get(gone).await.unwrap(), None);
        assert!(store.get(kept).await.unwrap().is_some());
        assert!(store.get(running.job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::in_memory(DAY);
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(sweeper(&dir, &store).run_forever(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    /// Memory backend with switchable failures.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_keys: AtomicBool,
        fail_delete_key: Option<String>,
        key_listings: AtomicUsize,
    }

    #[async_trait]
    impl KvBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
            self.inner.set_ex(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            if self.fail_delete_key.as_deref() == Some(key) {
                return Err(StoreError::Backend("READONLY replica".into()));
            }
            self.inner.delete(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.key_listings.fetch_add(1, Ordering::SeqCst);
            if self.fail_keys.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.keys(prefix).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn unreadable_export_dir_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::in_memory(DAY);
        let not_a_dir = touch(&dir, "exports", SystemTime::now());
        let sweeper = CleanupSweeper::new(store, not_a_dir, DAY, DAY, DAY);

        let err = sweeper.run_once().await.unwrap_err();
        assert!(matches!(err, ExportError::Io(_)));
    }

    #[tokio::test]
    async fn failed_metadata_delete_is_reported_and_sweep_continues() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let stuck = Uuid::new_v4();
        let other = Uuid::new_v4();
        let backend = Arc::new(FlakyBackend {
            fail_delete_key: Some(key_for(stuck)),
            ..FlakyBackend::default()
        });
        let store = StatusStore::new(backend, 30 * DAY);
        for id in [stuck, other] {
            let name = artifact::file_name("export", id, Utc::now(), ExportFormat::Json, false);
            let path = touch(&dir, &name, now - 8 * DAY);
            store.put(&completed(id, path)).await.unwrap();
        }

        let report = sweeper(&dir, &store).run_once_at(now).await.unwrap();

        assert_eq!(report.deleted_files, 2);
        assert_eq!(report.deleted_metadata, 1);
        assert!(!report.errors.is_empty());
        assert!(report.errors.iter().all(|e| e.contains(&stuck.to_string())));
        assert!(store.get(stuck).await.unwrap().is_some());
        assert_eq!(store.get(other).await.unwrap(), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_retries_on_the_short_interval() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FlakyBackend::default());
        backend.fail_keys.store(true, Ordering::SeqCst);
        let store = StatusStore::new(backend.clone(), DAY);
        let retry = Duration::from_secs(60);
        let sweeper = CleanupSweeper::new(store, dir.path().join("absent"), 7 * DAY, DAY, retry);
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(sweeper.run_forever(shutdown.clone()));
        let runs = || backend.key_listings.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs(), 1);

        tokio::time::sleep(retry).await;
        assert_eq!(runs(), 2);

        // Recovers on the next retry, then falls back to the full interval.
        backend.fail_keys.store(false, Ordering::SeqCst);
        tokio::time::sleep(retry).await;
        assert_eq!(runs(), 3);

        tokio::time::sleep(2 * retry).await;
        assert_eq!(runs(), 3);

        tokio::time::sleep(DAY).await;
        assert_eq!(runs(), 4);

        shutdown.notify_one();
        handle.await.unwrap();
    }
}
