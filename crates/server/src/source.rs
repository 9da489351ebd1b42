//! Record source over a directory of newline-delimited JSON files.
//!
//! Every `*.jsonl` file under the records directory is read in path order,
//! one JSON object per line. Lines that are not JSON objects are skipped
//! with a warning.
//!
//! Paging keeps a cursor per query: a fetch that starts where the previous
//! full page of the same query ended resumes at that file and byte position
//! instead of rescanning. Any other offset scans from the start. A resumed
//! scan keeps the file list of the first page, so files added mid-export
//! are not picked up.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

use stupid_export::{RawRecord, RecordQuery, RecordSource, SourceError};

/// Open cursors kept at once; the oldest is dropped first.
const MAX_CURSORS: usize = 16;

/// Where a scan stopped: the next unread byte of `files[file]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Position {
    file: usize,
    byte: u64,
}

#[derive(Debug)]
struct Cursor {
    query: RecordQuery,
    /// Matching records consumed before `position`.
    offset: usize,
    files: Vec<PathBuf>,
    position: Position,
}

pub struct JsonlRecordSource {
    dir: PathBuf,
    cursors: Mutex<Vec<Cursor>>,
}

impl JsonlRecordSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cursors: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn files(dir: &Path) -> Result<Vec<PathBuf>, SourceError> {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "Records directory not found");
            return Err(SourceError::Unavailable("records directory not found".into()));
        }

        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable records entry");
                    None
                }
            })
            .map(|entry| entry.into_path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "jsonl"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Walk matching records from `from` in order, stopping once `visit`
    /// returns false. Returns the position just past the last record read.
    fn scan(
        files: &[PathBuf],
        from: Position,
        query: &RecordQuery,
        mut visit: impl FnMut(RawRecord) -> bool,
    ) -> Result<Position, SourceError> {
        for (idx, path) in files.iter().enumerate().skip(from.file) {
            let mut file = File::open(path).map_err(|e| {
                warn!(file = %path.display(), error = %e, "Failed to open records file");
                SourceError::Unavailable(format!("cannot open records file ({})", e.kind()))
            })?;
            let mut byte = if idx == from.file { from.byte } else { 0 };
            if byte > 0 {
                file.seek(SeekFrom::Start(byte)).map_err(|e| {
                    SourceError::Unavailable(format!("cannot resume records file ({})", e.kind()))
                })?;
            }

            let mut reader = BufReader::new(file);
            let mut buf = String::new();
            loop {
                buf.clear();
                let line_start = byte;
                let read = reader.read_line(&mut buf).map_err(|e| {
                    SourceError::Decode(format!("read error at byte {} ({})", line_start, e.kind()))
                })?;
                if read == 0 {
                    break;
                }
                byte += read as u64;

                let line = buf.trim();
                if line.is_empty() {
                    continue;
                }
                let record = match serde_json::from_str::<Value>(line) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) => {
                        warn!(file = %path.display(), byte = line_start, "Skipping non-object record line");
                        continue;
                    }
                    Err(e) => {
                        warn!(file = %path.display(), byte = line_start, error = %e, "Skipping corrupt record line");
                        continue;
                    }
                };
                if query.matches(&record) && !visit(record) {
                    return Ok(Position { file: idx, byte });
                }
            }
        }
        Ok(Position {
            file: files.len(),
            byte: 0,
        })
    }

    async fn take_cursor(&self, query: &RecordQuery, offset: usize) -> Option<Cursor> {
        let mut cursors = self.cursors.lock().await;
        let idx = cursors
            .iter()
            .position(|c| c.offset == offset && c.query == *query)?;
        Some(cursors.swap_remove(idx))
    }

    async fn keep_cursor(&self, cursor: Cursor) {
        let mut cursors = self.cursors.lock().await;
        if cursors.len() >= MAX_CURSORS {
            cursors.remove(0);
        }
        cursors.push(cursor);
    }
}

fn reader_task_failed(e: JoinError) -> SourceError {
    error!(error = %e, "Record reader task failed");
    SourceError::Unavailable("record reader task failed".into())
}

#[async_trait]
impl RecordSource for JsonlRecordSource {
    async fn fetch(
        &self,
        query: &RecordQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let resume = self.take_cursor(query, offset).await;
        let resumed = resume.is_some();
        let dir = self.dir.clone();
        let query = query.clone();

        let (batch, cursor) = tokio::task::spawn_blocking(move || {
            let (files, from, mut skip) = match resume {
                Some(cursor) => (cursor.files, cursor.position, 0),
                None => (JsonlRecordSource::files(&dir)?, Position::default(), offset),
            };
            let mut batch = Vec::with_capacity(limit.min(4096));
            let position = JsonlRecordSource::scan(&files, from, &query, |record| {
                if skip > 0 {
                    skip -= 1;
                    return true;
                }
                batch.push(record);
                batch.len() < limit
            })?;
            let cursor = Cursor {
                query,
                offset: offset + batch.len(),
                files,
                position,
            };
            Ok::<_, SourceError>((batch, cursor))
        })
        .await
        .map_err(reader_task_failed)??;

        debug!(offset, limit, resumed, returned = batch.len(), "Fetched records from JSONL source");
        if batch.len() == limit {
            self.keep_cursor(cursor).await;
        }
        Ok(batch)
    }

    async fn count(&self, query: &RecordQuery) -> Result<Option<u64>, SourceError> {
        let dir = self.dir.clone();
        let query = query.clone();
        tokio::task::spawn_blocking(move || {
            let files = JsonlRecordSource::files(&dir)?;
            let mut total = 0u64;
            JsonlRecordSource::scan(&files, Position::default(), &query, |_| {
                total += 1;
                true
            })?;
            Ok(Some(total))
        })
        .await
        .map_err(reader_task_failed)?
    }
}
