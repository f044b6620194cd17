//! Decides which catalog slots still need to run for an image.

use std::fmt;

use crate::catalog::{AnalyzerCategory, TaskCatalog, TaskKey};
use crate::config::Config;
use crate::fingerprint::ImageIdentity;
use crate::record::AnalysisRecord;

/// Why a set of tasks was selected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingReason {
    /// No record exists for this identity or path
    New,
    /// Reprocessing was forced
    Forced,
    /// A record exists for this path but for different bytes
    ContentChanged,
    /// Only missing or failed slots of an existing record
    Incremental,
}

impl fmt::Display for PendingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PendingReason::New => "new",
            PendingReason::Forced => "forced",
            PendingReason::ContentChanged => "content changed",
            PendingReason::Incremental => "incremental",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTasks {
    pub keys: Vec<TaskKey>,
    pub reason: PendingReason,
}

impl PendingTasks {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// A stored record must not be reused
    pub fn needs_fresh_record(&self) -> bool {
        matches!(
            self.reason,
            PendingReason::New | PendingReason::ContentChanged
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    /// Re-run slots whose stored result is an error
    pub retry_failed: bool,
}

impl ChangeDetector {
    pub fn new(retry_failed: bool) -> Self {
        Self { retry_failed }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.processing.retry_failed_tasks)
    }

    /// Tasks to run for the image currently identified by `current`.
    ///
    /// `record` is whatever the store returned for this identity, or for the
    /// file's location when the identity is unknown.
    pub fn pending_tasks(
        &self,
        catalog: &TaskCatalog,
        current: &ImageIdentity,
        record: Option<&AnalysisRecord>,
        force: bool,
    ) -> PendingTasks {
        let (reason, existing) = match record {
            None => (PendingReason::New, None),
            Some(r) if r.identity() != current => (PendingReason::ContentChanged, None),
            Some(_) if force => (PendingReason::Forced, None),
            Some(r) => (PendingReason::Incremental, Some(r)),
        };

        let mut keys: Vec<TaskKey> = catalog
            .iter()
            .filter(|key| match existing {
                None => true,
                Some(record) => match record.result(key) {
                    None => true,
                    Some(result) if result.is_success() => false,
                    Some(_) => self.retry_failed,
                },
            })
            .cloned()
            .collect();

        // Stable: catalog order is kept inside each category
        keys.sort_by_key(|key| key.category() != AnalyzerCategory::Clip);

        PendingTasks { keys, reason }
    }
}
