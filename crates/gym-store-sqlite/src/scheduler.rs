use gym_store_core::{BackupCategory, BackupRecord};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::{load_backup_config, BackupManager, SnapshotStore, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledRunReport {
    pub backup: BackupRecord,
    pub retention_days: u32,
    pub deleted: usize,
}

/// Entry point for whatever external process fires scheduled backups.
///
/// Reads the stored `backup_config`; when it is inactive nothing happens and
/// `None` is returned. Otherwise creates an `automatic` backup and prunes the
/// archive with the configured retention.
///
/// # Errors
/// Returns an error when the config cannot be read, the backup cannot be
/// created, or the archive cannot be listed for cleanup.
pub fn run_scheduled_backup(
    store: &SnapshotStore,
    manager: &BackupManager,
) -> Result<Option<ScheduledRunReport>, StoreError> {
    run_scheduled_backup_at(store, manager, OffsetDateTime::now_utc())
}

/// [`run_scheduled_backup`] against an explicit current time.
///
/// # Errors
/// Same as [`run_scheduled_backup`].
pub fn run_scheduled_backup_at(
    store: &SnapshotStore,
    manager: &BackupManager,
    now: OffsetDateTime,
) -> Result<Option<ScheduledRunReport>, StoreError> {
    let config = load_backup_config(store.conn())?;
    if !config.activo {
        info!("scheduled backups are disabled, skipping");
        return Ok(None);
    }

    let backup = manager.create_at(BackupCategory::Automatic, now)?;
    let deleted = manager.cleanup_at(config.mantener_backups, now)?;
    info!(
        "scheduled backup {} done, {deleted} expired backups removed (retention {} days)",
        backup.name, config.mantener_backups
    );
    Ok(Some(ScheduledRunReport { backup, retention_days: config.mantener_backups, deleted }))
}
