use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tempfile::NamedTempFile;

use super::error::{PersistenceError, PersistenceResult};
use super::migration::decode_record;
use super::{latest_at_path, RecordStore};
use crate::fingerprint::ImageIdentity;
use crate::record::AnalysisRecord;

/// `(directory, filename)` as stored in a record's file info
type Location = (String, String);

/// Newest document recorded at one location
#[derive(Debug, Clone)]
struct IndexEntry {
    document: PathBuf,
    date_processed: DateTime<Utc>,
}

type LocationIndex = HashMap<Location, IndexEntry>;

/// File-per-record store: `<directory>/<identity>.json`.
///
/// Path lookups go through an in-memory location index built by the first
/// lookup and kept current by `save`. Legacy documents keep their original
/// file names, so the index maps to document paths rather than identities.
pub struct JsonFileStore {
    directory: PathBuf,
    locations: Mutex<Option<LocationIndex>>,
    scans: AtomicUsize,
}

fn location_of(record: &AnalysisRecord) -> Location {
    (
        record.file_info.directory.clone(),
        record.file_info.filename.clone(),
    )
}

/// Keep the newest document per location; later entries win ties
fn index_document(index: &mut LocationIndex, document: &Path, record: &AnalysisRecord) {
    let date_processed = record.file_info.date_processed;
    let entry = IndexEntry {
        document: document.to_path_buf(),
        date_processed,
    };
    index
        .entry(location_of(record))
        .and_modify(|current| {
            if current.document == document || current.date_processed <= date_processed {
                *current = entry.clone();
            }
        })
        .or_insert(entry);
}

fn index_of(documents: &[(PathBuf, AnalysisRecord)]) -> LocationIndex {
    let mut index = LocationIndex::new();
    for (path, record) in documents {
        index_document(&mut index, path, record);
    }
    debug!("Indexed {} record locations", index.len());
    index
}

impl JsonFileStore {
    /// Open (and create if needed) a record directory
    pub fn open<P: AsRef<Path>>(directory: P) -> PersistenceResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).map_err(|e| PersistenceError::Io(directory.clone(), e))?;
        Ok(Self {
            directory,
            locations: Mutex::new(None),
            scans: AtomicUsize::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, identity: &ImageIdentity) -> PersistenceResult<PathBuf> {
        let id = identity.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(PersistenceError::Other(format!(
                "Identity '{}' is not a valid record name",
                id
            )));
        }
        Ok(self.directory.join(format!("{}.json", id)))
    }

    fn read_record(path: &Path) -> PersistenceResult<Option<AnalysisRecord>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::Io(path.to_path_buf(), e)),
        };

        let value: Value = serde_json::from_str(&contents)?;
        decode_record(value).map(Some)
    }

    /// Number of full directory reads so far
    #[cfg(test)]
    pub(crate) fn full_scans(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    fn locations(&self) -> MutexGuard<'_, Option<LocationIndex>> {
        self.locations.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read_all(&self) -> PersistenceResult<Vec<AnalysisRecord>> {
        Ok(self.scan()?.into_iter().map(|(_, record)| record).collect())
    }

    /// Every readable record document in the directory, unreadable ones are skipped
    fn scan(&self) -> PersistenceResult<Vec<(PathBuf, AnalysisRecord)>> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let entries =
            fs::read_dir(&self.directory).map_err(|e| PersistenceError::Io(self.directory.clone(), e))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PersistenceError::Io(self.directory.clone(), e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if is_summary_file(&path) {
                continue;
            }

            match Self::read_record(&path) {
                Ok(Some(record)) => records.push((path, record)),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|(_, a), (_, b)| a.identity().cmp(b.identity()));
        Ok(records)
    }
}

fn is_summary_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with("_summary.json"))
        .unwrap_or(false)
}

impl RecordStore for JsonFileStore {
    fn load(&self, identity: &ImageIdentity) -> PersistenceResult<Option<AnalysisRecord>> {
        Self::read_record(&self.path_for(identity)?)
    }

    fn save(&self, record: &AnalysisRecord) -> PersistenceResult<()> {
        let target = self.path_for(record.identity())?;
        let body = serde_json::to_vec_pretty(record)?;

        // Write next to the target so the rename stays on one filesystem
        let mut temp = NamedTempFile::new_in(&self.directory)
            .map_err(|e| PersistenceError::Io(self.directory.clone(), e))?;
        temp.write_all(&body)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| PersistenceError::Io(temp.path().to_path_buf(), e))?;
        temp.persist(&target)
            .map_err(|e| PersistenceError::Io(target.clone(), e.error))?;

        if let Some(index) = self.locations().as_mut() {
            index_document(index, &target, record);
        }

        debug!("Saved record {}", target.display());
        Ok(())
    }

    fn exists(&self, identity: &ImageIdentity) -> PersistenceResult<bool> {
        Ok(self.path_for(identity)?.is_file())
    }

    fn find_by_path(
        &self,
        directory: &str,
        filename: &str,
    ) -> PersistenceResult<Option<AnalysisRecord>> {
        let location = (directory.to_string(), filename.to_string());
        let document = {
            let mut locations = self.locations();
            if locations.is_none() {
                *locations = Some(index_of(&self.scan()?));
            }
            locations
                .as_ref()
                .and_then(|index| index.get(&location))
                .map(|entry| entry.document.clone())
        };
        let document = match document {
            Some(document) => document,
            None => return Ok(None),
        };

        match Self::read_record(&document) {
            Ok(Some(record)) if location_of(&record) == location => Ok(Some(record)),
            _ => {
                // Changed behind the index; the scan runs under the lock so
                // concurrent saves land in the rebuilt index
                let mut locations = self.locations();
                let documents = self.scan()?;
                *locations = Some(index_of(&documents));
                Ok(latest_at_path(documents.iter().map(|(_, r)| r), directory, filename).cloned())
            }
        }
    }

    fn list(&self) -> PersistenceResult<Vec<AnalysisRecord>> {
        self.read_all()
    }

    fn remove(&self, identity: &ImageIdentity) -> PersistenceResult<bool> {
        let path = self.path_for(identity)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                // An older document may now be the newest at that location
                *self.locations() = None;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistenceError::Io(path, e)),
        }
    }
}
