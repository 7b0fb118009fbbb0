//! Error types for quire operations

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum QuireError {
    #[error("Storage error on {}: {source}", .path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("Index connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Composition not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("History out of sync: {missing_entries} unindexed files, {missing_files} orphaned index rows, {mismatches} mismatches (run 'quire rebuild')")]
    Drift {
        missing_entries: usize,
        missing_files: usize,
        mismatches: usize,
    },

    #[error("No active composition")]
    NoActiveComposition,

    #[error("Invalid timestamp {value:?}: {message}")]
    InvalidTimestamp { value: String, message: String },

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuireError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StorageIo {
            path: path.into(),
            source,
        }
    }

    /// True when SQLite rejected an FTS5 MATCH expression.
    pub fn is_fts_syntax(&self) -> bool {
        match self {
            Self::Index(rusqlite::Error::SqliteFailure(_, Some(message))) => {
                message.starts_with("fts5:")
                    || message.contains("unterminated string")
                    || message.contains("malformed MATCH")
            }
            _ => false,
        }
    }

    /// True for a missing file or a zero-row index write.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::StorageIo { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
