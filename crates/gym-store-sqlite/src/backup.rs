use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use gym_store_core::{backup_file_name, parse_backup_file_name, BackupCategory, BackupRecord, CoreError};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::snapshot::sibling_with_suffix;
use crate::{SnapshotStore, StoreError, StorePaths};

/// Result of a restore: the archived copy that was put live, and the manual
/// backup taken of the file it replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub restored: BackupRecord,
    pub safety_backup: BackupRecord,
}

/// Dated, categorized archive of the live database file.
///
/// Layout: `<backups_dir>/manual/` and `<backups_dir>/automatic/`, each
/// holding `<prefix>_YYYY-MM-DDTHH-MM-SS.db` files.
#[derive(Debug, Clone)]
pub struct BackupManager {
    paths: StorePaths,
}

impl BackupManager {
    /// # Errors
    /// Returns [`StoreError::InvalidConfig`] when the backup prefix is empty
    /// or contains characters other than ASCII letters, digits, `_` and `-`.
    pub fn new(paths: StorePaths) -> Result<Self, StoreError> {
        let prefix = &paths.backup_prefix;
        if prefix.is_empty()
            || !prefix.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        {
            return Err(CoreError::Validation(format!("invalid backup prefix {prefix:?}")).into());
        }
        Ok(Self { paths })
    }

    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    #[must_use]
    pub fn category_dir(&self, category: BackupCategory) -> PathBuf {
        self.paths.backups_dir.join(category.as_str())
    }

    /// Copy the live file into `category`, named after the current time.
    ///
    /// # Errors
    /// Returns [`StoreError::SourceMissing`] when the live file does not
    /// exist, or the I/O error from the copy.
    pub fn create(&self, category: BackupCategory) -> Result<BackupRecord, StoreError> {
        self.create_at(category, OffsetDateTime::now_utc())
    }

    /// [`BackupManager::create`] with an explicit timestamp for the name.
    /// A backup created in the same second and category overwrites the
    /// earlier one.
    ///
    /// # Errors
    /// Same as [`BackupManager::create`].
    pub fn create_at(&self, category: BackupCategory, at: OffsetDateTime) -> Result<BackupRecord, StoreError> {
        let source = &self.paths.db_path;
        if !source.exists() {
            return Err(StoreError::SourceMissing(source.clone()));
        }

        let dir = self.category_dir(category);
        fs::create_dir_all(&dir)?;
        let name = backup_file_name(&self.paths.backup_prefix, at);
        let target = dir.join(&name);
        fs::copy(source, &target)?;

        let record = record_for(category, name, target.clone(), &fs::metadata(&target)?)?;
        info!("created {category} backup {} ({} bytes)", record.name, record.size_bytes);
        Ok(record)
    }

    /// Every archived backup in both categories, most recently modified
    /// first. Files that do not follow the naming scheme are skipped.
    ///
    /// # Errors
    /// Returns an error when a category directory cannot be read.
    pub fn list(&self) -> Result<Vec<BackupRecord>, StoreError> {
        let mut records = Vec::new();
        for category in BackupCategory::ALL {
            let dir = self.category_dir(category);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let metadata = entry.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if parse_backup_file_name(&self.paths.backup_prefix, &name).is_none() {
                    continue;
                }
                records.push(record_for(category, name, entry.path(), &metadata)?);
            }
        }

        records.sort_by(|left, right| {
            right.modified_at.cmp(&left.modified_at).then_with(|| right.name.cmp(&left.name))
        });
        Ok(records)
    }

    /// Put an archived copy back as the live file and reload `store` from it.
    ///
    /// The chosen backup is staged next to the live file first, then a
    /// manual safety backup of the current live file is taken, then the
    /// staged copy is renamed over the live file. Callers should treat this
    /// as a privileged operation; a process restart may still be advisable
    /// for anything holding data read before the restore.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidBackupName`], [`StoreError::BackupNotFound`],
    /// [`StoreError::SourceMissing`], [`StoreError::StorePathMismatch`] or
    /// [`StoreError::RestoreWriteFailed`].
    pub fn restore(
        &self,
        store: &mut SnapshotStore,
        name: &str,
        category: BackupCategory,
    ) -> Result<RestoreOutcome, StoreError> {
        let source = self.existing_backup(name, category)?;
        let live = &self.paths.db_path;
        if store.path() != Some(live.as_path()) {
            return Err(StoreError::StorePathMismatch {
                expected: live.clone(),
                actual: store.path().map(Path::to_path_buf),
            });
        }
        if !live.exists() {
            return Err(StoreError::SourceMissing(live.clone()));
        }

        let restored = record_for(category, name.to_string(), source.clone(), &fs::metadata(&source)?)?;

        let staged = sibling_with_suffix(live, ".restore.tmp");
        fs::copy(&source, &staged)
            .map_err(|source| StoreError::RestoreWriteFailed { path: staged.clone(), source })?;

        let safety_backup = match self.create(BackupCategory::Manual) {
            Ok(record) => record,
            Err(err) => {
                discard(&staged);
                return Err(err);
            }
        };

        if let Err(source) = fs::rename(&staged, live) {
            discard(&staged);
            return Err(StoreError::RestoreWriteFailed { path: live.clone(), source });
        }

        store.reload()?;
        info!(
            "restored {category} backup {name} over {} (safety backup {})",
            live.display(),
            safety_backup.name
        );
        Ok(RestoreOutcome { restored, safety_backup })
    }

    /// # Errors
    /// Returns [`StoreError::InvalidBackupName`] or [`StoreError::BackupNotFound`],
    /// or the I/O error from the removal.
    pub fn delete(&self, name: &str, category: BackupCategory) -> Result<(), StoreError> {
        let path = self.existing_backup(name, category)?;
        fs::remove_file(&path)?;
        info!("deleted {category} backup {name}");
        Ok(())
    }

    /// Delete every backup last modified more than `retention_days` ago.
    /// Returns how many were deleted.
    ///
    /// # Errors
    /// Returns an error only when the archive cannot be listed; individual
    /// deletion failures are logged and skipped.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize, StoreError> {
        self.cleanup_at(retention_days, OffsetDateTime::now_utc())
    }

    /// [`BackupManager::cleanup`] against an explicit current time.
    ///
    /// # Errors
    /// Same as [`BackupManager::cleanup`].
    pub fn cleanup_at(&self, retention_days: u32, now: OffsetDateTime) -> Result<usize, StoreError> {
        self.cleanup_with(retention_days, now, |path| fs::remove_file(path))
    }

    fn cleanup_with<F>(&self, retention_days: u32, now: OffsetDateTime, mut remove: F) -> Result<usize, StoreError>
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let mut deleted = 0;
        for record in self.list()? {
            if record.modified_at >= cutoff {
                continue;
            }
            match remove(&record.path) {
                Ok(()) => {
                    info!("removed expired {} backup {}", record.category, record.name);
                    deleted += 1;
                }
                Err(err) => warn!("failed to remove expired backup {}: {err}", record.path.display()),
            }
        }
        Ok(deleted)
    }

    fn existing_backup(&self, name: &str, category: BackupCategory) -> Result<PathBuf, StoreError> {
        if parse_backup_file_name(&self.paths.backup_prefix, name).is_none() {
            return Err(StoreError::InvalidBackupName(name.to_string()));
        }
        let path = self.category_dir(category).join(name);
        if !path.is_file() {
            return Err(StoreError::BackupNotFound { category, name: name.to_string() });
        }
        Ok(path)
    }
}

fn record_for(
    category: BackupCategory,
    name: String,
    path: PathBuf,
    metadata: &Metadata,
) -> Result<BackupRecord, StoreError> {
    Ok(BackupRecord {
        name,
        category,
        path,
        size_bytes: metadata.len(),
        modified_at: OffsetDateTime::from(metadata.modified()?),
    })
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!("failed to remove staged restore file {}: {err}", path.display());
    }
}
