use std::collections::HashMap;
use std::sync::RwLock;

use super::error::{PersistenceError, PersistenceResult};
use super::{latest_at_path, RecordStore};
use crate::fingerprint::ImageIdentity;
use crate::record::AnalysisRecord;

/// In-memory store for tests and embedders that persist elsewhere
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<ImageIdentity, AnalysisRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> PersistenceError {
    PersistenceError::Other("memory store lock poisoned".to_string())
}

/// Copy handed back to callers; the status is judged from results as any
/// other backend would after a round trip
fn restored(record: &AnalysisRecord) -> AnalysisRecord {
    let mut record = record.clone();
    record.rederive_status();
    record
}

impl RecordStore for MemoryStore {
    fn load(&self, identity: &ImageIdentity) -> PersistenceResult<Option<AnalysisRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(identity).map(restored))
    }

    fn save(&self, record: &AnalysisRecord) -> PersistenceResult<()> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert(record.identity().clone(), record.clone());
        Ok(())
    }

    fn exists(&self, identity: &ImageIdentity) -> PersistenceResult<bool> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.contains_key(identity))
    }

    fn find_by_path(
        &self,
        directory: &str,
        filename: &str,
    ) -> PersistenceResult<Option<AnalysisRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(latest_at_path(records.values(), directory, filename).map(restored))
    }

    fn list(&self) -> PersistenceResult<Vec<AnalysisRecord>> {
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut all: Vec<AnalysisRecord> = records.values().map(restored).collect();
        all.sort_by(|a, b| a.identity().cmp(b.identity()));
        Ok(all)
    }

    fn remove(&self, identity: &ImageIdentity) -> PersistenceResult<bool> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        Ok(records.remove(identity).is_some())
    }
}
