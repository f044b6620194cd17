//! Record store adapter.
//!
//! One [`AnalysisRecord`] per [`ImageIdentity`], behind the [`RecordStore`]
//! trait so the JSON-file, SQLite and in-memory backends are interchangeable.

mod error;
mod json;
mod memory;
mod migration;
mod sqlite;

pub use error::{PersistenceError, PersistenceResult};
pub use json::JsonFileStore;
pub use memory::MemoryStore;
pub use migration::{decode_record, LEGACY_PROMPT_ID};
pub use sqlite::SqliteStore;

use log::info;

use crate::config::{Config, StoreBackend};
use crate::fingerprint::ImageIdentity;
use crate::record::AnalysisRecord;

/// Storage contract shared by every backend.
///
/// `save` must be atomic from a reader's perspective. Backends serialize
/// writes internally; callers guarantee a single writer per identity.
pub trait RecordStore: Send + Sync {
    /// Load the record for an identity
    fn load(&self, identity: &ImageIdentity) -> PersistenceResult<Option<AnalysisRecord>>;

    /// Insert or replace a record
    fn save(&self, record: &AnalysisRecord) -> PersistenceResult<()>;

    /// Check whether a record exists for an identity
    fn exists(&self, identity: &ImageIdentity) -> PersistenceResult<bool>;

    /// Most recently processed record for a file location
    fn find_by_path(
        &self,
        directory: &str,
        filename: &str,
    ) -> PersistenceResult<Option<AnalysisRecord>>;

    /// Every stored record, ordered by identity
    fn list(&self) -> PersistenceResult<Vec<AnalysisRecord>>;

    /// Explicitly delete a record; returns whether one existed
    fn remove(&self, identity: &ImageIdentity) -> PersistenceResult<bool>;
}

/// Open the backend selected by configuration
pub fn open_store(config: &Config) -> PersistenceResult<Box<dyn RecordStore>> {
    match config.store.backend {
        StoreBackend::Json => {
            let store = JsonFileStore::open(&config.store.output_directory)?;
            info!(
                "JSON record store opened at {}",
                config.store.output_directory.display()
            );
            Ok(Box::new(store))
        }
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(&config.store.database_path)?;
            info!(
                "SQLite record store opened at {}",
                config.store.database_path.display()
            );
            Ok(Box::new(store))
        }
    }
}

/// Pick the most recently processed record matching a location
pub(crate) fn latest_at_path<'a>(
    records: impl Iterator<Item = &'a AnalysisRecord>,
    directory: &str,
    filename: &str,
) -> Option<&'a AnalysisRecord> {
    records
        .filter(|r| r.file_info.directory == directory && r.file_info.filename == filename)
        .max_by_key(|r| r.file_info.date_processed)
}
