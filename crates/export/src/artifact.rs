//! Deterministic artifact naming.
//!
//! Artifacts are named `<prefix>_<job_id>_<YYYYmmddTHHMMSS>.<ext>` so the
//! sweeper can recover the owning job from a bare file name. In-flight writes
//! use the same name with a `.partial` suffix.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{ExportFormat, JobId};

pub const PARTIAL_SUFFIX: &str = ".partial";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Name of an artifact, without its extension.
pub fn stem(prefix: &str, job_id: JobId, generated_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        job_id.as_hyphenated(),
        generated_at.format(TIMESTAMP_FORMAT)
    )
}

/// Full artifact file name for a job.
pub fn file_name(
    prefix: &str,
    job_id: JobId,
    generated_at: DateTime<Utc>,
    format: ExportFormat,
    compress: bool,
) -> String {
    format!(
        "{}.{}",
        stem(prefix, job_id, generated_at),
        format.extension(compress)
    )
}

/// Temporary path a writer fills before renaming to `dest`.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}

/// Recover the job id from an artifact (or partial) file name.
///
/// Returns `None` for names that do not follow the artifact scheme.
pub fn parse_job_id(file_name: &str) -> Option<JobId> {
    let name = file_name.strip_suffix(PARTIAL_SUFFIX).unwrap_or(file_name);
    let mut parts = name.splitn(3, '_');
    let _prefix = parts.next().filter(|p| !p.is_empty())?;
    let id = parts.next()?;
    let rest = parts.next()?;
    if rest.len() < TIMESTAMP_LEN || !rest.is_char_boundary(TIMESTAMP_LEN) {
        return None;
    }
    Uuid::parse_str(id).ok()
}

const TIMESTAMP_LEN: usize = "20240101T000000".len();
