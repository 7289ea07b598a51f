use gym_store_core::{BackupConfig, BackupFrequency, BackupTime, CoreError};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::introspect::table_exists;
use crate::{now_rfc3339, SnapshotStore, StoreError};

/// Read the singleton scheduling record, falling back to defaults when the
/// table or its row does not exist yet.
///
/// # Errors
/// Returns [`StoreError::InvalidConfig`] when the stored row holds values
/// outside the accepted domain, or the underlying read error.
pub fn load_backup_config(conn: &Connection) -> Result<BackupConfig, StoreError> {
    if !table_exists(conn, "backup_config")? {
        return Ok(BackupConfig::default());
    }

    let row = conn
        .query_row(
            "SELECT frecuencia, hora, mantener_backups, activo FROM backup_config WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((frecuencia, hora, mantener_backups, activo)) = row else {
        return Ok(BackupConfig::default());
    };

    let config = BackupConfig {
        frecuencia: BackupFrequency::parse(&frecuencia).ok_or_else(|| {
            CoreError::Validation(format!("unknown frecuencia {frecuencia:?}"))
        })?,
        hora: hora.parse::<BackupTime>()?,
        mantener_backups: u32::try_from(mantener_backups).map_err(|_| {
            CoreError::Validation(format!("mantener_backups out of range: {mantener_backups}"))
        })?,
        activo: activo != 0,
    };
    config.validate()?;
    Ok(config)
}

/// Validate and upsert the singleton row, then persist.
///
/// # Errors
/// Returns [`StoreError::InvalidConfig`] for invalid values, or the write or
/// persistence error.
pub fn save_backup_config(store: &SnapshotStore, config: &BackupConfig) -> Result<(), StoreError> {
    config.validate()?;
    store.run(
        "INSERT INTO backup_config(id, frecuencia, hora, mantener_backups, activo, actualizado_en)
         VALUES (1, ?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
           frecuencia = excluded.frecuencia,
           hora = excluded.hora,
           mantener_backups = excluded.mantener_backups,
           activo = excluded.activo,
           actualizado_en = excluded.actualizado_en",
        params![
            config.frecuencia.as_str(),
            config.hora.to_string(),
            i64::from(config.mantener_backups),
            i64::from(config.activo),
            now_rfc3339()?,
        ],
    )?;
    info!(
        "backup config updated: frecuencia={} hora={} mantener_backups={} activo={}",
        config.frecuencia.as_str(),
        config.hora,
        config.mantener_backups,
        config.activo
    );
    Ok(())
}
