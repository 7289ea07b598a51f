//! Embedded store lifecycle for the gym database: snapshot persistence of an
//! in-memory SQLite handle, ledgered lazy migrations, check-in tokens, and
//! the dated backup archive.

use std::path::{Path, PathBuf};

use gym_store_core::DEFAULT_BACKUP_PREFIX;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod backup;
mod config;
mod error;
mod introspect;
mod rebuild;
mod scheduler;
mod schema;
mod snapshot;
mod token;

pub use backup::{BackupManager, RestoreOutcome};
pub use config::{load_backup_config, save_backup_config};
pub use error::StoreError;
pub use introspect::{schema_state, SchemaState};
pub use scheduler::{run_scheduled_backup, run_scheduled_backup_at, ScheduledRunReport};
pub use schema::{
    AppliedMigration, MigrationFailure, MigrationReport, PendingMigration, SchemaManager, SchemaStatus,
};
pub use snapshot::{ForeignKeyViolation, IntegrityReport, SnapshotStore};
pub use token::TokenGenerator;

/// Where the live database file and its backup archive live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorePaths {
    pub db_path: PathBuf,
    pub backups_dir: PathBuf,
    pub backup_prefix: String,
}

impl StorePaths {
    /// Defaults for a database file: backups under `<db dir>/backups`,
    /// named with the `gym_backup` prefix.
    #[must_use]
    pub fn for_database(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let parent = db_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self {
            backups_dir: parent.join("backups"),
            db_path,
            backup_prefix: DEFAULT_BACKUP_PREFIX.to_string(),
        }
    }

    #[must_use]
    pub fn with_backups_dir(mut self, backups_dir: impl Into<PathBuf>) -> Self {
        self.backups_dir = backups_dir.into();
        self
    }

    #[must_use]
    pub fn with_backup_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.backup_prefix = prefix.into();
        self
    }
}

/// Process start: load the live file and bring its schema up to date.
///
/// Individual migration failures are reported, not raised; the returned
/// store is ready for traffic either way.
///
/// # Errors
/// Returns an error when the file cannot be loaded or a snapshot save fails.
pub fn open_store(paths: &StorePaths) -> Result<(SnapshotStore, MigrationReport), StoreError> {
    let store = SnapshotStore::load(&paths.db_path)?;
    let report = SchemaManager::new(&store).apply_pending()?;
    Ok((store, report))
}

pub(crate) fn now_rfc3339() -> Result<String, StoreError> {
    Ok(OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339)?)
}
