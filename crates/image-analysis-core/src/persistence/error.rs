use std::path::PathBuf;

/// Result type for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Persistence-specific errors
#[derive(Debug)]
pub enum PersistenceError {
    /// SQLite errors
    Database(rusqlite::Error),

    /// Filesystem errors while reading or writing record files
    Io(PathBuf, std::io::Error),

    /// Record could not be encoded or decoded
    Serialization(String),

    /// Record written by an unknown schema version
    UnsupportedSchema(u32),

    /// Errors during store initialization
    Initialization(String),

    /// General errors
    Other(String),
}

impl PersistenceError {
    /// Whether retrying further writes is pointless (disk full, read-only, denied)
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_, err) => matches!(
                err.kind(),
                std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::StorageFull
                    | std::io::ErrorKind::ReadOnlyFilesystem
            ),
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DiskFull
                    | rusqlite::ErrorCode::ReadOnly
                    | rusqlite::ErrorCode::PermissionDenied
                    | rusqlite::ErrorCode::CannotOpen
            ),
            Self::Initialization(_) => true,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(err: rusqlite::Error) -> Self {
        PersistenceError::Database(err)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(err) => write!(f, "Database error: {}", err),
            Self::Io(path, err) => write!(f, "I/O error for {}: {}", path.display(), err),
            Self::Serialization(msg) => write!(f, "Record encoding error: {}", msg),
            Self::UnsupportedSchema(version) => {
                write!(f, "Unsupported record schema version {}", version)
            }
            Self::Initialization(msg) => write!(f, "Store initialization error: {}", msg),
            Self::Other(msg) => write!(f, "Persistence error: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(err) => Some(err),
            Self::Io(_, err) => Some(err),
            _ => None,
        }
    }
}

// Implement conversion from PersistenceError to the main Error type
impl From<PersistenceError> for crate::Error {
    fn from(err: PersistenceError) -> Self {
        crate::Error::Storage(err.to_string())
    }
}
