//! Export stored records for use outside the tool.
//!
//! JSON exports are the records exactly as stored. CSV exports hold one row
//! per record with yes/no flags for each analyzer category.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::catalog::AnalyzerCategory;
use crate::error::{Error, Result};
use crate::record::AnalysisRecord;

pub const CSV_HEADER: [&str; 10] = [
    "identity",
    "filename",
    "directory",
    "status",
    "file_size",
    "clip_analysis",
    "llm_analysis",
    "metadata",
    "date_added",
    "date_processed",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl std::str::FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(Error::Configuration(format!(
                "Unknown export format '{}', expected 'json' or 'csv'",
                other
            ))),
        }
    }
}

/// Write `records` to `out` in the given format
pub fn export_records<W: Write>(
    records: &[AnalysisRecord],
    format: ExportFormat,
    mut out: W,
) -> Result<()> {
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut out, records)?;
            writeln!(out)?;
        }
        ExportFormat::Csv => {
            write_csv_row(&mut out, CSV_HEADER.iter().map(|h| h.to_string()))?;
            for record in records {
                write_csv_row(&mut out, csv_fields(record).into_iter())?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

/// Export to a file, creating its parent directory
pub fn export_to_file(records: &[AnalysisRecord], format: ExportFormat, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)?;
    export_records(records, format, BufWriter::new(file))
}

fn yes_no(flag: bool) -> String {
    let text = if flag { "Yes" } else { "No" };
    text.to_string()
}

fn has_success_in(record: &AnalysisRecord, category: AnalyzerCategory) -> bool {
    record
        .results_for(category)
        .any(|(_, result)| result.is_success())
}

fn csv_fields(record: &AnalysisRecord) -> Vec<String> {
    vec![
        record.identity().to_string(),
        record.file_info.filename.clone(),
        record.file_info.directory.clone(),
        record.processing_status().to_string(),
        record.file_info.size.to_string(),
        yes_no(has_success_in(record, AnalyzerCategory::Clip)),
        yes_no(has_success_in(record, AnalyzerCategory::Llm)),
        yes_no(record.metadata.is_some()),
        record.file_info.date_added.to_rfc3339(),
        record.file_info.date_processed.to_rfc3339(),
    ]
}

fn write_csv_row<W: Write>(out: &mut W, fields: impl Iterator<Item = String>) -> Result<()> {
    let line: Vec<String> = fields.map(|f| quote_csv_field(&f)).collect();
    writeln!(out, "{}", line.join(","))?;
    Ok(())
}

/// Quote a field when it holds a separator, quote or line break
fn quote_csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{TaskCatalog, TaskKey};
    use crate::fingerprint::ImageIdentity;
    use crate::record::TaskResult;
    use crate::types::ImageFile;
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn record(hex: &str, path: &str) -> AnalysisRecord {
        let file = ImageFile {
            path: PathBuf::from(path),
            size: 512,
            last_modified: SystemTime::now(),
            extension: "jpg".to_string(),
        };
        AnalysisRecord::new(ImageIdentity::from_hex(hex), &file)
    }

    #[test]
    fn test_csv_has_one_row_per_record() {
        let mut a = record("aa01", "holiday/beach.jpg");
        a.record_result(&TaskKey::clip("best"), TaskResult::success(json!({"prompt": "sea"}), 1));
        a.record_result(&TaskKey::llm("p1", "m"), TaskResult::error("timeout", 3));
        a.refresh_status(&TaskCatalog::from_keys(vec![
            TaskKey::clip("best"),
            TaskKey::llm("p1", "m"),
        ]));
        let b = record("bb02", "holiday/hill.jpg");

        let mut out = Vec::new();
        export_records(&[a, b], ExportFormat::Csv, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.join(","));

        let row: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(&row[..8], &["aa01", "beach.jpg", "holiday", "partial", "512", "Yes", "No", "No"]);
        assert!(lines[2].starts_with("bb02,hill.jpg,holiday,pending,512,No,No,No,"));
    }

    #[test]
    fn test_csv_quotes_awkward_file_names() {
        assert_eq!(quote_csv_field("plain.jpg"), "plain.jpg");
        assert_eq!(quote_csv_field("a,b.jpg"), "\"a,b.jpg\"");
        assert_eq!(quote_csv_field("say \"cheese\".jpg"), "\"say \"\"cheese\"\".jpg\"");

        let mut out = Vec::new();
        export_records(&[record("cc03", "dir/x, y.jpg")], ExportFormat::Csv, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().nth(1).unwrap().starts_with("cc03,\"x, y.jpg\",dir,"));
    }

    #[test]
    fn test_json_export_reads_back_as_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("export.json");
        let mut a = record("dd04", "p/q.jpg");
        a.record_result(&TaskKey::clip("fast"), TaskResult::success(json!({"prompt": "q"}), 1));

        export_to_file(&[a], ExportFormat::Json, &path).unwrap();

        let value: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let exported = value.as_array().unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0]["identity"], "dd04");
        assert_eq!(exported[0]["results"]["clip:fast"]["payload"]["prompt"], "q");
    }

    #[test]
    fn test_format_names() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}
