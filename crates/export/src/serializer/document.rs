use std::io::Write;

use serde::Serialize;

use super::DocumentMeta;
use crate::error::SerializeError;
use crate::record::ExportRecord;

#[derive(Serialize)]
struct Document<'a> {
    metadata: &'a DocumentMeta,
    data: &'a [ExportRecord],
}

/// Write the structured document: a metadata header followed by the records.
pub fn write_document<W: Write>(
    out: &mut W,
    records: &[ExportRecord],
    meta: &DocumentMeta,
) -> Result<(), SerializeError> {
    serde_json::to_writer(&mut *out, &Document { metadata: meta, data: records })?;
    out.flush()?;
    Ok(())
}
