use chrono::SecondsFormat;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::error::{PersistenceError, PersistenceResult};
use super::migration::decode_record;
use super::RecordStore;
use crate::fingerprint::ImageIdentity;
use crate::record::AnalysisRecord;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS analysis_records (
        identity TEXT PRIMARY KEY,
        schema_version INTEGER NOT NULL,
        filename TEXT NOT NULL,
        directory TEXT NOT NULL,
        size INTEGER NOT NULL,
        date_added TEXT NOT NULL,
        date_processed TEXT NOT NULL,
        processing_status TEXT NOT NULL,
        record_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_records_location ON analysis_records(directory, filename);
    CREATE INDEX IF NOT EXISTS idx_records_status ON analysis_records(processing_status);";

/// Table-row store: one row per identity, full record kept as JSON
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and initialize if needed) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> PersistenceResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistenceError::Io(parent.to_path_buf(), e))?;
        }

        let conn = Connection::open(path).map_err(|e| {
            PersistenceError::Initialization(format!(
                "Failed to open database {}: {}",
                path.display(),
                e
            ))
        })?;

        // Set pragmas for concurrent readers and a single writer
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 10000;",
        )?;

        Self::initialize(conn)
    }

    /// Private database for tests
    pub fn open_in_memory() -> PersistenceResult<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> PersistenceResult<Self> {
        conn.execute_batch(SCHEMA).map_err(|e| {
            PersistenceError::Initialization(format!("Failed to create schema: {}", e))
        })?;
        info!("SQLite record schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> PersistenceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PersistenceError::Other("connection lock poisoned".to_string()))
    }

    fn decode(json: String) -> PersistenceResult<AnalysisRecord> {
        let value: Value = serde_json::from_str(&json)?;
        decode_record(value)
    }

    /// Number of stored records
    pub fn count(&self) -> PersistenceResult<usize> {
        let conn = self.conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM analysis_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl RecordStore for SqliteStore {
    fn load(&self, identity: &ImageIdentity) -> PersistenceResult<Option<AnalysisRecord>> {
        let json: Option<String> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT record_json FROM analysis_records WHERE identity = ?1",
                [identity.as_str()],
                |row| row.get(0),
            )
            .optional()?
        };
        json.map(Self::decode).transpose()
    }

    fn save(&self, record: &AnalysisRecord) -> PersistenceResult<()> {
        let json = serde_json::to_string(record)?;
        let info = &record.file_info;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO analysis_records
                (identity, schema_version, filename, directory, size,
                 date_added, date_processed, processing_status, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(identity) DO UPDATE SET
                schema_version = excluded.schema_version,
                filename = excluded.filename,
                directory = excluded.directory,
                size = excluded.size,
                date_processed = excluded.date_processed,
                processing_status = excluded.processing_status,
                record_json = excluded.record_json",
            params![
                record.identity().as_str(),
                record.schema_version,
                info.filename,
                info.directory,
                info.size as i64,
                info.date_added.to_rfc3339_opts(SecondsFormat::Micros, true),
                info.date_processed.to_rfc3339_opts(SecondsFormat::Micros, true),
                record.processing_status().to_string(),
                json,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn exists(&self, identity: &ImageIdentity) -> PersistenceResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM analysis_records WHERE identity = ?1",
                [identity.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn find_by_path(
        &self,
        directory: &str,
        filename: &str,
    ) -> PersistenceResult<Option<AnalysisRecord>> {
        let json: Option<String> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT record_json FROM analysis_records
                 WHERE directory = ?1 AND filename = ?2
                 ORDER BY date_processed DESC
                 LIMIT 1",
                params![directory, filename],
                |row| row.get(0),
            )
            .optional()?
        };
        json.map(Self::decode).transpose()
    }

    fn list(&self) -> PersistenceResult<Vec<AnalysisRecord>> {
        let rows: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt =
                conn.prepare("SELECT record_json FROM analysis_records ORDER BY identity")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            rows
        };
        rows.into_iter().map(Self::decode).collect()
    }

    fn remove(&self, identity: &ImageIdentity) -> PersistenceResult<bool> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM analysis_records WHERE identity = ?1",
            [identity.as_str()],
        )?;
        Ok(removed > 0)
    }
}
