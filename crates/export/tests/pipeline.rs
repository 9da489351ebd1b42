//! End-to-end scenarios for the export pipeline.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

use stupid_core::config::ExportSettings;
use stupid_export::artifact;
use stupid_export::source::StaticRecordSource;
use stupid_export::{
    CleanupSweeper, DataType, ExportConfig, ExportError, ExportFormat, ExportJob, ExportService,
    JobStatus, RawRecord, RecordQuery, RecordSource, SourceError, StatusStore,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn log_records(n: usize) -> Vec<RawRecord> {
    (0..n)
        .map(|i| {
            json!({
                "record_type": "logs",
                "timestamp": format!("2024-06-01T00:00:{:02}Z", i % 60),
                "message": format!("event {}", i),
                "process": if i % 2 == 0 { "sshd" } else { "cron" },
            })
            .as_object()
            .cloned()
            .unwrap()
        })
        .collect()
}

/// Wraps a static source, recording the size of every fetch and optionally
/// failing on the n-th call.
struct ScriptedSource {
    inner: StaticRecordSource,
    fail_on_call: Option<usize>,
    fetches: Mutex<Vec<usize>>,
}

impl ScriptedSource {
    fn new(records: Vec<RawRecord>, fail_on_call: Option<usize>) -> Self {
        Self {
            inner: StaticRecordSource::new(records),
            fail_on_call,
            fetches: Mutex::new(Vec::new()),
        }
    }

    fn fetch_sizes(&self) -> Vec<usize> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch(
        &self,
        query: &RecordQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let call = self.fetches.lock().unwrap().len() + 1;
        if self.fail_on_call == Some(call) {
            self.fetches.lock().unwrap().push(0);
            return Err(SourceError::Unavailable("upstream timed out".into()));
        }
        let batch = self.inner.fetch(query, offset, limit).await?;
        self.fetches.lock().unwrap().push(batch.len());
        Ok(batch)
    }
}

struct Harness {
    _dir: TempDir,
    export_dir: std::path::PathBuf,
    service: ExportService,
}

fn harness(source: Arc<dyn RecordSource>) -> Harness {
    let dir = TempDir::new().unwrap();
    let export_dir = dir.path().join("exports");
    let settings = ExportSettings {
        export_dir: export_dir.clone(),
        ..ExportSettings::default()
    };
    let store = StatusStore::in_memory(settings.status_ttl());
    let service = ExportService::from_settings(source, store, &settings);
    Harness {
        _dir: dir,
        export_dir,
        service,
    }
}

fn files_in(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn run_to_end(h: &Harness, config: ExportConfig) -> ExportJob {
    let job = h.service.submit(config).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    h.service.wait(job.job_id).await.unwrap().unwrap();
    h.service.get_status(job.job_id).await.unwrap().unwrap()
}

fn logs_config(batch_size: usize) -> ExportConfig {
    let mut config = ExportConfig::for_types(vec![DataType::Logs]);
    config.batch_size = batch_size;
    config
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn batched_export_completes_with_three_fetches() {
    let source = Arc::new(ScriptedSource::new(log_records(25), None));
    let h = harness(source.clone());

    let job = run_to_end(&h, logs_config(10)).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.record_count, Some(25));
    assert_eq!(source.fetch_sizes(), vec![10, 10, 5]);
    assert_eq!(job.progress.processed, 25);

    let path = job.file_path.expect("artifact path");
    assert!(path.exists());
    assert!(fs::metadata(&path).unwrap().len() > 0);
    assert_eq!(job.file_size, Some(fs::metadata(&path).unwrap().len()));
}

#[tokio::test]
async fn progress_reported_once_per_batch() {
    use stupid_export::{JobProgress, JobRunner, ProgressSink, StoreError};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<JobProgress>>);

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn report(&self, _job_id: Uuid, progress: JobProgress) -> Result<(), StoreError> {
            self.0.lock().unwrap().push(progress);
            Ok(())
        }
    }

    let dir = TempDir::new().unwrap();
    let runner = JobRunner::new(
        Arc::new(ScriptedSource::new(log_records(25), None)),
        dir.path(),
        "export",
    );
    let recorder = Recorder::default();

    runner
        .run(Uuid::new_v4(), &logs_config(10), &recorder)
        .await
        .unwrap();

    let processed: Vec<u64> = recorder.0.lock().unwrap().iter().map(|p| p.processed).collect();
    assert_eq!(processed, vec![10, 20, 25]);
}

#[tokio::test]
async fn zero_records_complete_without_artifact() {
    let h = harness(Arc::new(ScriptedSource::new(vec![], None)));

    let job = run_to_end(&h, logs_config(10)).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.record_count, Some(0));
    assert!(job.file_path.is_none());
    assert!(files_in(&h.export_dir).is_empty());
}

#[tokio::test]
async fn source_failure_mid_run_fails_job_without_leftovers() {
    let source = Arc::new(ScriptedSource::new(log_records(25), Some(2)));
    let h = harness(source.clone());

    let job = run_to_end(&h, logs_config(10)).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.file_path.is_none());
    let message = job.error_message.expect("error message");
    assert!(!message.is_empty());
    assert!(message.contains("upstream timed out"));
    assert!(files_in(&h.export_dir).is_empty());
    assert_eq!(source.fetch_sizes().len(), 2);
}

#[tokio::test]
async fn delete_twice_then_absent() {
    let h = harness(Arc::new(ScriptedSource::new(log_records(3), None)));
    let job = run_to_end(&h, logs_config(10)).await;

    h.service.delete(job.job_id).await.unwrap();
    h.service.delete(job.job_id).await.unwrap();

    assert!(h.service.get_status(job.job_id).await.unwrap().is_none());
    assert!(files_in(&h.export_dir).is_empty());
}

#[tokio::test]
async fn json_document_round_trip_count() {
    let h = harness(Arc::new(ScriptedSource::new(log_records(12), None)));

    let job = run_to_end(&h, logs_config(5)).await;

    let doc: Value = serde_json::from_slice(&fs::read(job.file_path.unwrap()).unwrap()).unwrap();
    assert_eq!(doc["metadata"]["record_count"], 12);
    assert_eq!(doc["metadata"]["format"], "json");
    assert_eq!(doc["metadata"]["job_id"], job.job_id.to_string());
    assert_eq!(doc["data"].as_array().unwrap().len(), 12);
}

#[tokio::test]
async fn csv_header_is_union_of_record_keys() {
    let mut records = log_records(2);
    records.push(
        json!({"record_type": "metrics", "timestamp": 0, "name": "load", "value": 1.5, "region": "eu"})
            .as_object()
            .cloned()
            .unwrap(),
    );
    let h = harness(Arc::new(ScriptedSource::new(records, None)));
    let mut config = ExportConfig::for_types(vec![DataType::Logs, DataType::Metrics]);
    config.format = ExportFormat::Csv;

    let job = run_to_end(&h, config).await;

    let text = fs::read_to_string(job.file_path.unwrap()).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "message,name,process,record_type,region,timestamp,value"
    );
    assert_eq!(lines.count(), 3);
}

#[tokio::test]
async fn process_filter_narrows_export() {
    let h = harness(Arc::new(ScriptedSource::new(log_records(10), None)));
    let mut config = logs_config(100);
    config.process_filter = Some(vec!["sshd".into()]);

    let job = run_to_end(&h, config).await;

    assert_eq!(job.record_count, Some(5));
}

#[tokio::test]
async fn bundle_export_holds_both_formats() {
    let h = harness(Arc::new(ScriptedSource::new(log_records(4), None)));
    let mut config = logs_config(10);
    config.format = ExportFormat::Zip;

    let job = run_to_end(&h, config).await;

    let path = job.file_path.unwrap();
    assert!(path.to_string_lossy().ends_with(".zip"));
    let archive = zip::ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
    let mut names: Vec<&str> = archive.file_names().collect();
    names.sort();
    assert_eq!(names.len(), 2);
    assert!(names[0].ends_with(".csv"));
    assert!(names[1].ends_with(".json"));
}

// ── Configuration ───────────────────────────────────────────────────

#[test]
fn end_date_must_follow_start_date() {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    for (end, ok) in [
        (start - chrono::Duration::hours(1), false),
        (start, false),
        (start + chrono::Duration::seconds(1), true),
    ] {
        let mut config = logs_config(10);
        config.start_date = Some(start);
        config.end_date = Some(end);
        assert_eq!(config.validated(10_000).is_ok(), ok, "end = {}", end);
    }
}

#[tokio::test]
async fn rejected_config_is_synchronous() {
    let h = harness(Arc::new(ScriptedSource::new(log_records(1), None)));

    let err = h
        .service
        .submit_json(json!({"data_types": ["logs", "spans"]}))
        .await
        .unwrap_err();

    assert!(matches!(err, ExportError::InvalidConfig(_)));
    assert!(h.service.list_jobs(50, 0).await.unwrap().is_empty());
}

// ── Cleanup ─────────────────────────────────────────────────────────

#[tokio::test]
async fn sweeper_retention_boundary() {
    let dir = TempDir::new().unwrap();
    let store = StatusStore::in_memory(Duration::from_secs(3600));
    let retention = Duration::from_secs(7 * 24 * 60 * 60);
    let sweeper = CleanupSweeper::new(
        store.clone(),
        dir.path(),
        retention,
        Duration::from_secs(60),
        Duration::from_secs(60),
    );
    let now = SystemTime::now();

    let old_id = Uuid::new_v4();
    let old_name = artifact::file_name("export", old_id, Utc::now(), ExportFormat::Json, false);
    let old = dir.path().join(&old_name);
    fs::write(&old, b"{}").unwrap();
    fs::File::options()
        .write(true)
        .open(&old)
        .unwrap()
        .set_modified(now - retention - Duration::from_secs(1))
        .unwrap();
    let mut old_job = ExportJob::pending(old_id, logs_config(10));
    old_job.status = JobStatus::Completed;
    old_job.file_path = Some(old.clone());
    store.put(&old_job).await.unwrap();

    let young_name = artifact::file_name("export", Uuid::new_v4(), Utc::now(), ExportFormat::Json, false);
    let young = dir.path().join(&young_name);
    fs::write(&young, b"{}").unwrap();
    fs::File::options()
        .write(true)
        .open(&young)
        .unwrap()
        .set_modified(now - retention + Duration::from_secs(1))
        .unwrap();

    let report = sweeper.run_once_at(now).await.unwrap();

    assert!(!old.exists());
    assert!(young.exists());
    assert_eq!(report.deleted_files, 1);
    assert_eq!(report.deleted_metadata, 1);
    assert!(store.get(old_id).await.unwrap().is_none());
}

#[tokio::test]
async fn manual_cleanup_reconciles_removed_artifacts() {
    let h = harness(Arc::new(ScriptedSource::new(log_records(2), None)));
    let job = run_to_end(&h, logs_config(10)).await;
    fs::remove_file(job.file_path.unwrap()).unwrap();

    let report = h.service.run_cleanup().await.unwrap();

    assert_eq!(report.deleted_metadata, 1);
    assert!(report.errors.is_empty());
    assert!(h.service.get_status(job.job_id).await.unwrap().is_none());
}
