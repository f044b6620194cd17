//! Processing of a single image file: read, fingerprint, detect, execute, save.

use log::{debug, warn};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use thiserror::Error;

use crate::analyzer::ImagePayload;
use crate::catalog::TaskCatalog;
use crate::detector::{ChangeDetector, PendingReason};
use crate::executor::TaskExecutor;
use crate::fingerprint::{fingerprint_bytes, ImageIdentity};
use crate::logging::log_record_change;
use crate::metadata::extract_metadata;
use crate::persistence::{PersistenceError, RecordStore};
use crate::record::{AnalysisRecord, ProcessingStatus};
use crate::types::ImageFile;

/// Serializes load-modify-save cycles per identity.
///
/// Files with identical bytes share an identity; only one of them may hold
/// its record at a time.
#[derive(Default)]
pub struct IdentityLocks {
    held: Mutex<HashSet<ImageIdentity>>,
    released: Condvar,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other worker holds `identity`
    pub fn acquire(&self, identity: &ImageIdentity) -> IdentityGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        while held.contains(identity) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|p| p.into_inner());
        }
        held.insert(identity.clone());

        IdentityGuard {
            locks: self,
            identity: identity.clone(),
        }
    }

    pub fn is_held(&self, identity: &ImageIdentity) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(identity)
    }
}

/// Releases its identity on drop
pub struct IdentityGuard<'a> {
    locks: &'a IdentityLocks,
    identity: ImageIdentity,
}

impl Drop for IdentityGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.identity);
        self.locks.released.notify_all();
    }
}

/// What happened to one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Nothing pending; the record was left untouched
    Skipped,
    Processed {
        tasks_run: usize,
        tasks_failed: usize,
    },
    /// Tasks ran but no slot of the current catalog succeeded; the record was still saved
    Failed {
        message: String,
        tasks_run: usize,
        tasks_failed: usize,
    },
}

/// Failures that prevent a file from being recorded
#[derive(Error, Debug)]
pub enum FileError {
    #[error("{0}")]
    Read(crate::Error),

    #[error("{0}")]
    Storage(PersistenceError),
}

impl From<PersistenceError> for FileError {
    fn from(err: PersistenceError) -> Self {
        FileError::Storage(err)
    }
}

/// Everything needed to process files of one batch
pub struct FileProcessor<'a> {
    pub store: &'a dyn RecordStore,
    pub executor: &'a TaskExecutor,
    pub catalog: &'a TaskCatalog,
    pub detector: ChangeDetector,
    pub locks: &'a IdentityLocks,
    pub extract_metadata: bool,
}

impl FileProcessor<'_> {
    pub fn process(&self, file: &ImageFile, force: bool) -> Result<FileOutcome, FileError> {
        // One read serves the identity and the payload, so both see the same bytes
        let bytes = read_image(file)?;
        let identity = fingerprint_bytes(&bytes);
        let _guard = self.locks.acquire(&identity);

        let stored = match self.store.load(&identity)? {
            Some(record) => Some(record),
            None => self
                .store
                .find_by_path(&file.directory(), &file.filename())?,
        };

        let pending = self
            .detector
            .pending_tasks(self.catalog, &identity, stored.as_ref(), force);

        if pending.is_empty() {
            debug!("{}: nothing pending ({})", file.path.display(), pending.reason);
            return Ok(FileOutcome::Skipped);
        }

        if pending.reason == PendingReason::ContentChanged {
            log_record_change(&identity, &file.path, "content changed, starting a new record");
        }

        let mut record = match stored {
            Some(existing) if !pending.needs_fresh_record() => existing,
            _ => AnalysisRecord::new(identity.clone(), file),
        };

        if self.extract_metadata && record.metadata.is_none() {
            match extract_metadata(&file.path) {
                Ok(metadata) => record.metadata = Some(metadata),
                Err(e) => warn!("Metadata extraction failed for {}: {}", file.path.display(), e),
            }
        }

        let image = ImagePayload::from_bytes(&bytes, file.mime_type());
        drop(bytes);

        let mut tasks_failed = 0;
        let mut last_error = None;
        for key in &pending.keys {
            let result = self.executor.execute_with_payload(key, &image);
            if !result.is_success() {
                tasks_failed += 1;
                last_error = result
                    .error_message
                    .as_ref()
                    .map(|msg| format!("{}: {}", key, msg));
            }
            record.record_result(key, result);
        }
        let tasks_run = pending.keys.len();

        record.refresh_status(self.catalog);
        record.touch(file);
        self.store.save(&record)?;

        log_record_change(
            &identity,
            &file.path,
            &format!(
                "{} ({} run, {} failed, status {})",
                pending.reason,
                tasks_run,
                tasks_failed,
                record.processing_status()
            ),
        );

        if record.processing_status() == ProcessingStatus::Failed {
            Ok(FileOutcome::Failed {
                message: last_error.unwrap_or_else(|| "no task succeeded".to_string()),
                tasks_run,
                tasks_failed,
            })
        } else {
            Ok(FileOutcome::Processed {
                tasks_run,
                tasks_failed,
            })
        }
    }
}

fn read_image(file: &ImageFile) -> Result<Vec<u8>, FileError> {
    std::fs::read(&file.path).map_err(|e| {
        FileError::Read(match e.kind() {
            std::io::ErrorKind::NotFound => crate::Error::FileNotFound(file.path.clone()),
            _ => crate::Error::Io(e),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_identity_lock_excludes_second_holder() {
        let locks = Arc::new(IdentityLocks::new());
        let id = ImageIdentity::from_hex("abcd");

        let guard = locks.acquire(&id);
        assert!(locks.is_held(&id));

        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let locks = locks.clone();
            let entered = entered.clone();
            let id = id.clone();
            thread::spawn(move || {
                let _g = locks.acquire(&id);
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!locks.is_held(&id));
    }

    #[test]
    fn test_distinct_identities_do_not_block() {
        let locks = IdentityLocks::new();
        let _a = locks.acquire(&ImageIdentity::from_hex("aa"));
        let _b = locks.acquire(&ImageIdentity::from_hex("bb"));
        assert!(locks.is_held(&ImageIdentity::from_hex("aa")));
        assert!(locks.is_held(&ImageIdentity::from_hex("bb")));
    }
}
