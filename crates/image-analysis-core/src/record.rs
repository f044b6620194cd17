//! The persisted unit of work for one image.
//!
//! An [`AnalysisRecord`] is created the first time an [`ImageIdentity`] is
//! seen and is updated in place as tasks complete. Its processing status is
//! always derived from its results and the current catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::catalog::{AnalyzerCategory, TaskCatalog, TaskKey};
use crate::fingerprint::ImageIdentity;
use crate::metadata::ImageMetadata;
use crate::types::ImageFile;

/// Schema version written by this crate
pub const SCHEMA_VERSION: u32 = 2;

/// Outcome of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
}

/// Result of running one analysis slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,

    /// Analyzer output, opaque to the orchestrator
    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub completed_at: DateTime<Utc>,

    /// Number of attempts made, including the successful one
    #[serde(default)]
    pub attempts: u32,
}

impl TaskResult {
    pub fn success(payload: Value, attempts: u32) -> Self {
        Self {
            status: TaskStatus::Success,
            payload,
            error_message: None,
            completed_at: Utc::now(),
            attempts,
        }
    }

    pub fn error(message: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: TaskStatus::Error,
            payload: Value::Null,
            error_message: Some(message.into()),
            completed_at: Utc::now(),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Derived status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Partial,
    Complete,
    Failed,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Partial => "partial",
            ProcessingStatus::Complete => "complete",
            ProcessingStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Provenance of the file a record was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    pub directory: String,
    pub size: u64,
    pub date_added: DateTime<Utc>,
    pub date_processed: DateTime<Utc>,
}

/// All analysis results for one image identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub schema_version: u32,
    identity: ImageIdentity,
    pub file_info: FileInfo,
    results: BTreeMap<String, TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ImageMetadata>,
    processing_status: ProcessingStatus,
}

impl AnalysisRecord {
    /// Create an empty record for a newly seen identity
    pub fn new(identity: ImageIdentity, file: &ImageFile) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            identity,
            file_info: FileInfo {
                filename: file.filename(),
                directory: file.directory(),
                size: file.size,
                date_added: now,
                date_processed: now,
            },
            results: BTreeMap::new(),
            metadata: None,
            processing_status: ProcessingStatus::Pending,
        }
    }

    /// Assemble a record from stored parts; status starts as pending until refreshed
    pub(crate) fn from_parts(
        identity: ImageIdentity,
        file_info: FileInfo,
        results: BTreeMap<String, TaskResult>,
    ) -> Self {
        let mut record = Self {
            schema_version: SCHEMA_VERSION,
            identity,
            file_info,
            results,
            metadata: None,
            processing_status: ProcessingStatus::Pending,
        };
        record.processing_status = record.status_from_results();
        record
    }

    pub fn identity(&self) -> &ImageIdentity {
        &self.identity
    }

    pub fn processing_status(&self) -> ProcessingStatus {
        self.processing_status
    }

    pub fn results(&self) -> &BTreeMap<String, TaskResult> {
        &self.results
    }

    pub fn result(&self, key: &TaskKey) -> Option<&TaskResult> {
        self.results.get(&key.encode())
    }

    /// Results belonging to one analyzer category
    pub fn results_for(
        &self,
        category: AnalyzerCategory,
    ) -> impl Iterator<Item = (&String, &TaskResult)> {
        let prefix = format!("{}:", category.as_str());
        self.results
            .iter()
            .filter(move |(key, _)| key.starts_with(&prefix))
    }

    /// Whether a slot holds a successful result
    pub fn has_success(&self, key: &TaskKey) -> bool {
        self.result(key).map(TaskResult::is_success).unwrap_or(false)
    }

    /// Insert or overwrite the result of one slot
    pub fn record_result(&mut self, key: &TaskKey, result: TaskResult) {
        self.results.insert(key.encode(), result);
    }

    /// Number of successful results across all slots
    pub fn success_count(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    /// Update provenance after a successful run
    pub fn touch(&mut self, file: &ImageFile) {
        self.file_info.filename = file.filename();
        self.file_info.directory = file.directory();
        self.file_info.size = file.size;
        self.file_info.date_processed = Utc::now();
    }

    /// Recompute the status against the catalog in force
    pub fn refresh_status(&mut self, catalog: &TaskCatalog) {
        self.processing_status = if catalog.is_empty() {
            self.status_from_results()
        } else {
            let mut with_result = 0;
            let mut succeeded = 0;
            for key in catalog.iter() {
                if let Some(result) = self.result(key) {
                    with_result += 1;
                    if result.is_success() {
                        succeeded += 1;
                    }
                }
            }

            if with_result == 0 {
                ProcessingStatus::Pending
            } else if succeeded == catalog.len() {
                ProcessingStatus::Complete
            } else if succeeded > 0 {
                ProcessingStatus::Partial
            } else {
                ProcessingStatus::Failed
            }
        };
    }

    /// Re-derive the status of a record read back from storage.
    ///
    /// No catalog is known at that point, so the status is judged from the
    /// stored results alone; callers holding a catalog refine it with
    /// [`refresh_status`](Self::refresh_status).
    pub(crate) fn rederive_status(&mut self) {
        self.processing_status = self.status_from_results();
    }

    /// Status judged from the record alone, used when no catalog applies
    fn status_from_results(&self) -> ProcessingStatus {
        let succeeded = self.success_count();
        if self.results.is_empty() {
            if self.file_info.date_processed > self.file_info.date_added {
                ProcessingStatus::Complete
            } else {
                ProcessingStatus::Pending
            }
        } else if succeeded == self.results.len() {
            ProcessingStatus::Complete
        } else if succeeded > 0 {
            ProcessingStatus::Partial
        } else {
            ProcessingStatus::Failed
        }
    }
}
