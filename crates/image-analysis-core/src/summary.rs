//! Batch totals and the summary files written after a batch.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::AnalyzerCategory;
use crate::error::Result;
use crate::metadata::ImageMetadata;
use crate::record::AnalysisRecord;

/// File name of the image-properties summary
pub const METADATA_SUMMARY_FILE: &str = "metadata_summary.json";

/// A file that could not be fully recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Totals of one batch.
///
/// Every discovered file lands in exactly one of `processed`, `skipped`,
/// `failed` or `cancelled`. Counts do not depend on processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub discovered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub tasks_run: usize,
    pub tasks_failed: usize,
    /// Sorted by path
    pub failures: Vec<FileFailure>,
}

impl BatchSummary {
    /// Files that reached a final outcome
    pub fn completed(&self) -> usize {
        self.processed + self.skipped + self.failed
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} discovered, {} processed, {} skipped, {} failed",
            self.discovered, self.processed, self.skipped, self.failed
        )?;
        if self.cancelled > 0 {
            write!(f, ", {} cancelled", self.cancelled)?;
        }
        write!(
            f,
            " ({} tasks run, {} tasks failed)",
            self.tasks_run, self.tasks_failed
        )
    }
}

#[derive(Debug, Serialize)]
struct SummaryEntry<'a> {
    filename: &'a str,
    directory: &'a str,
    identity: &'a str,
    results: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct MetadataEntry<'a> {
    filename: &'a str,
    directory: &'a str,
    identity: &'a str,
    metadata: &'a ImageMetadata,
}

/// File name of a category's summary
pub fn summary_file_name(category: AnalyzerCategory) -> String {
    format!("{}_analysis_summary.json", category.as_str())
}

/// Write one summary per category holding only successful payloads, plus
/// [`METADATA_SUMMARY_FILE`] when any record carries image properties.
///
/// Records without a successful result in a category are left out of that
/// category's summary. Returns the written paths.
pub fn write_summaries(records: &[AnalysisRecord], output_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)?;

    let mut written = Vec::new();
    for category in [AnalyzerCategory::Clip, AnalyzerCategory::Llm] {
        let entries: Vec<SummaryEntry<'_>> = records
            .iter()
            .filter_map(|record| {
                let results: Map<String, Value> = record
                    .results_for(category)
                    .filter(|(_, result)| result.is_success())
                    .map(|(key, result)| (key.clone(), result.payload.clone()))
                    .collect();
                if results.is_empty() {
                    return None;
                }
                Some(SummaryEntry {
                    filename: &record.file_info.filename,
                    directory: &record.file_info.directory,
                    identity: record.identity().as_str(),
                    results,
                })
            })
            .collect();

        let path = output_dir.join(summary_file_name(category));
        fs::write(&path, serde_json::to_vec_pretty(&entries)?)?;
        written.push(path);
    }

    let metadata: Vec<MetadataEntry<'_>> = records
        .iter()
        .filter_map(|record| {
            record.metadata.as_ref().map(|metadata| MetadataEntry {
                filename: &record.file_info.filename,
                directory: &record.file_info.directory,
                identity: record.identity().as_str(),
                metadata,
            })
        })
        .collect();
    if !metadata.is_empty() {
        let path = output_dir.join(METADATA_SUMMARY_FILE);
        fs::write(&path, serde_json::to_vec_pretty(&metadata)?)?;
        written.push(path);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TaskKey;
    use crate::fingerprint::ImageIdentity;
    use crate::record::TaskResult;
    use crate::types::ImageFile;
    use serde_json::json;
    use std::time::SystemTime;
    use tempfile::tempdir;

    fn record(hex: &str, name: &str) -> AnalysisRecord {
        let file = ImageFile {
            path: PathBuf::from(format!("pics/{}", name)),
            size: 3,
            last_modified: SystemTime::now(),
            extension: "jpg".to_string(),
        };
        AnalysisRecord::new(ImageIdentity::from_hex(hex), &file)
    }

    #[test]
    fn test_summaries_hold_only_successes() {
        let mut a = record("aa", "a.jpg");
        a.record_result(&TaskKey::clip("best"), TaskResult::success(json!({"prompt": "a"}), 1));
        a.record_result(&TaskKey::clip("fast"), TaskResult::error("timeout", 3));
        a.record_result(&TaskKey::llm("P1", "llava"), TaskResult::success(json!({"text": "A"}), 1));

        let mut b = record("bb", "b.jpg");
        b.record_result(&TaskKey::clip("best"), TaskResult::error("timeout", 3));

        let dir = tempdir().unwrap();
        let written = write_summaries(&[a, b], dir.path()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(!dir.path().join(METADATA_SUMMARY_FILE).exists());

        let clip: Value =
            serde_json::from_slice(&fs::read(dir.path().join("clip_analysis_summary.json")).unwrap())
                .unwrap();
        let clip = clip.as_array().unwrap();
        assert_eq!(clip.len(), 1);
        assert_eq!(clip[0]["filename"], "a.jpg");
        assert_eq!(clip[0]["results"]["clip:best"]["prompt"], "a");
        assert!(clip[0]["results"].get("clip:fast").is_none());

        let llm: Value =
            serde_json::from_slice(&fs::read(dir.path().join("llm_analysis_summary.json")).unwrap())
                .unwrap();
        assert_eq!(llm[0]["results"]["llm:P1:llava"]["text"], "A");
    }

    #[test]
    fn test_metadata_summary_lists_records_with_properties() {
        let mut a = record("aa", "a.jpg");
        a.metadata = Some(ImageMetadata {
            format: Some("Jpeg".to_string()),
            width: 640,
            height: 480,
            aspect_ratio: 640.0 / 480.0,
            file_modified: None,
        });
        let b = record("bb", "b.jpg");

        let dir = tempdir().unwrap();
        let written = write_summaries(&[a, b], dir.path()).unwrap();
        assert_eq!(written.len(), 3);
        assert_eq!(written[2], dir.path().join(METADATA_SUMMARY_FILE));

        let summary: Value =
            serde_json::from_slice(&fs::read(&written[2]).unwrap()).unwrap();
        let entries = summary.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["filename"], "a.jpg");
        assert_eq!(entries[0]["directory"], "pics");
        assert_eq!(entries[0]["identity"], "aa");
        assert_eq!(entries[0]["metadata"]["width"], 640);
        assert_eq!(entries[0]["metadata"]["format"], "Jpeg");
    }
}
