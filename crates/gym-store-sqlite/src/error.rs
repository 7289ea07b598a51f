use std::path::PathBuf;

use gym_store_core::{BackupCategory, CoreError};
use rusqlite::ffi;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("live database file does not exist: {}", .0.display())]
    SourceMissing(PathBuf),
    #[error("migration {name} failed: {message}")]
    MigrationStepFailed { name: String, message: String },
    #[error("rebuild of table {table} failed, original table left intact: {message}")]
    ConstraintRebuildFailed { table: String, message: String },
    #[error("backup not found: {category}/{name}")]
    BackupNotFound { category: BackupCategory, name: String },
    #[error("invalid backup file name: {0}")]
    InvalidBackupName(String),
    #[error("unique value collision: {0}")]
    UniqueCollision(String),
    #[error("failed to write restored database at {}: {source}", .path.display())]
    RestoreWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to persist database snapshot to {}: {message}", .path.display())]
    PersistenceWriteFailed { path: PathBuf, message: String },
    #[error("store is bound to {actual:?}, backups are managed for {}", .expected.display())]
    StorePathMismatch { expected: PathBuf, actual: Option<PathBuf> },
    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] CoreError),
    #[error("failed to format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Classify a failed write: duplicate business keys surface as
    /// [`StoreError::UniqueCollision`], everything else stays a SQLite error.
    pub(crate) fn from_write(err: rusqlite::Error) -> Self {
        if is_unique_violation(&err) {
            Self::UniqueCollision(err.to_string())
        } else {
            Self::Sqlite(err)
        }
    }

    /// Errors a redundant structural change raises when its effect is
    /// already present (e.g. "duplicate column name", "already exists").
    #[must_use]
    pub fn is_already_applied(&self) -> bool {
        let message = match self {
            Self::Sqlite(err) => err.to_string(),
            Self::MigrationStepFailed { message, .. } => message.clone(),
            _ => return false,
        };
        message.contains("duplicate column name") || message.contains("already exists")
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || inner.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

pub(crate) fn is_check_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.extended_code == ffi::SQLITE_CONSTRAINT_CHECK
    )
}
