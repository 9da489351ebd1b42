use std::fs::File;
use std::io::Write;

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{write_document, write_table, DocumentMeta};
use crate::error::SerializeError;
use crate::record::ExportRecord;

/// Write a zip holding `<stem>.json` and `<stem>.csv` renderings of the same records.
pub(super) fn write_bundle(
    file: File,
    stem: &str,
    records: &[ExportRecord],
    meta: &DocumentMeta,
) -> Result<File, SerializeError> {
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(format!("{}.json", stem), options)?;
    write_document(&mut zip, records, meta)?;

    zip.start_file(format!("{}.csv", stem), options)?;
    write_table(&mut zip, records)?;

    zip.flush()?;
    Ok(zip.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, ExportFormat};
    use chrono::Utc;
    use serde_json::json;
    use std::io::Read;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn bundle_contains_both_renderings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bundle.zip");

        let mut rec = ExportRecord::new(DataType::Anomalies);
        rec.fields.insert("timestamp".into(), json!("2024-01-01T00:00:00Z"));
        rec.fields.insert("score".into(), json!(0.9));
        let meta = DocumentMeta {
            exported_at: Utc::now(),
            record_count: 1,
            format: ExportFormat::Zip,
            data_types: vec![DataType::Anomalies],
            job_id: Uuid::new_v4(),
        };

        write_bundle(File::create(&path).unwrap(), "export_x", &[rec], &meta).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);

        let mut csv_text = String::new();
        archive
            .by_name("export_x.csv")
            .unwrap()
            .read_to_string(&mut csv_text)
            .unwrap();
        assert!(csv_text.starts_with("record_type,score,timestamp\n"));

        let mut json_text = String::new();
        archive
            .by_name("export_x.json")
            .unwrap()
            .read_to_string(&mut json_text)
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&json_text).unwrap();
        assert_eq!(doc["metadata"]["format"], "zip");
    }
}
