//! Renders cleaned records to an artifact on disk.
//!
//! Every format is written to `<dest>.partial` first and renamed into place
//! once complete, so a reader either sees a whole artifact at `dest` or
//! nothing. A failed write removes its partial file before returning.

mod bundle;
mod document;
mod tabular;

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, warn};

use crate::artifact;
use crate::error::SerializeError;
use crate::record::ExportRecord;
use crate::types::{DataType, ExportFormat, JobId};

pub use self::document::write_document;
pub use self::tabular::{header_for, write_table};

/// Header carried by the structured document (and the bundle's JSON entry).
#[derive(Debug, Clone, Serialize)]
pub struct DocumentMeta {
    pub exported_at: DateTime<Utc>,
    pub record_count: usize,
    pub format: ExportFormat,
    pub data_types: Vec<DataType>,
    pub job_id: JobId,
}

/// Write `records` to `dest` atomically. Returns the final file size.
pub fn write_artifact(
    records: &[ExportRecord],
    format: ExportFormat,
    compress: bool,
    dest: &Path,
    meta: &DocumentMeta,
) -> Result<u64, SerializeError> {
    let partial = artifact::partial_path(dest);

    let result = write_partial(records, format, compress, dest, &partial, meta)
        .and_then(|()| fs::rename(&partial, dest).map_err(SerializeError::from))
        .and_then(|()| Ok(fs::metadata(dest)?.len()));

    match result {
        Ok(size) => {
            debug!(path = %dest.display(), size, "Artifact written");
            Ok(size)
        }
        Err(e) => {
            remove_if_exists(&partial);
            Err(e)
        }
    }
}

fn write_partial(
    records: &[ExportRecord],
    format: ExportFormat,
    compress: bool,
    dest: &Path,
    partial: &Path,
    meta: &DocumentMeta,
) -> Result<(), SerializeError> {
    let file = File::create(partial)?;

    let file = match format {
        ExportFormat::Zip => {
            let stem = bundle_stem(dest);
            bundle::write_bundle(file, &stem, records, meta)?
        }
        ExportFormat::Json | ExportFormat::Csv if compress => {
            let mut gz = GzEncoder::new(BufWriter::new(file), Compression::default());
            write_single(&mut gz, format, records, meta)?;
            unbuffer(gz.finish()?)?
        }
        ExportFormat::Json | ExportFormat::Csv => {
            let mut out = BufWriter::new(file);
            write_single(&mut out, format, records, meta)?;
            unbuffer(out)?
        }
    };

    file.sync_all()?;
    Ok(())
}

fn write_single<W: Write>(
    out: &mut W,
    format: ExportFormat,
    records: &[ExportRecord],
    meta: &DocumentMeta,
) -> Result<(), SerializeError> {
    match format {
        ExportFormat::Csv => write_table(out, records),
        _ => write_document(out, records, meta),
    }
}

fn unbuffer(out: BufWriter<File>) -> io::Result<File> {
    out.into_inner().map_err(|e| e.into_error())
}

/// Entry-name stem for a bundle: the artifact name minus `.zip`.
fn bundle_stem(dest: &Path) -> String {
    dest.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string())
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
