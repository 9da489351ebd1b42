use std::collections::BTreeSet;
use std::io::Write;

use serde_json::Value;

use crate::error::SerializeError;
use crate::record::ExportRecord;

/// Sorted union of every key present in any record.
pub fn header_for(records: &[ExportRecord]) -> Vec<String> {
    let mut keys = BTreeSet::new();
    for record in records {
        for key in record.keys() {
            if !keys.contains(key) {
                keys.insert(key.to_string());
            }
        }
    }
    keys.into_iter().collect()
}

fn cell(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(nested) => nested.to_string(),
    }
}

/// Write records as CSV; records lacking a column get an empty cell.
pub fn write_table<W: Write>(out: &mut W, records: &[ExportRecord]) -> Result<(), SerializeError> {
    let header = header_for(records);
    if header.is_empty() {
        return Ok(());
    }

    let mut wtr = csv::Writer::from_writer(&mut *out);
    wtr.write_record(&header)?;
    for record in records {
        wtr.write_record(header.iter().map(|key| cell(record.column(key))))?;
    }
    wtr.flush()?;
    Ok(())
}
