use std::collections::BTreeSet;

use gym_store_core::derive_instructor_key;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::introspect::{table_exists, table_has_column};
use crate::rebuild::{accepts_value, rebuild_table, ShadowRebuild};
use crate::{now_rfc3339, SnapshotStore, StoreError, TokenGenerator};

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

const USUARIOS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL UNIQUE,
  nombre TEXT NOT NULL,
  password_hash TEXT NOT NULL,
  rol TEXT NOT NULL DEFAULT 'socio' CHECK (rol IN ('admin','recepcion','instructor','socio')),
  creado_en TEXT
);
";

const SOCIOS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  nombre TEXT NOT NULL,
  apellido TEXT,
  email TEXT UNIQUE,
  telefono TEXT,
  fecha_alta TEXT,
  fecha_vencimiento TEXT,
  estado TEXT NOT NULL DEFAULT 'activo',
  codigo_acceso TEXT,
  usuario_id INTEGER REFERENCES usuarios(id)
);
";

const INSTRUCTORES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  nombre TEXT NOT NULL,
  email TEXT NOT NULL UNIQUE,
  especialidad TEXT,
  activo INTEGER NOT NULL DEFAULT 1,
  creado_en TEXT
);
";

const CLASES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  nombre TEXT NOT NULL,
  instructor_id INTEGER REFERENCES instructores(id),
  dia_semana TEXT,
  hora_inicio TEXT,
  duracion_minutos INTEGER,
  cupo_maximo INTEGER DEFAULT 20
);
";

const RESERVAS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  socio_id INTEGER NOT NULL REFERENCES socios(id),
  clase_id INTEGER NOT NULL REFERENCES clases(id),
  fecha TEXT NOT NULL,
  estado TEXT NOT NULL DEFAULT 'confirmada'
    CHECK (estado IN ('confirmada','cancelada','asistio','ausente')),
  creado_en TEXT
);
";

const ASISTENCIAS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  socio_id INTEGER NOT NULL REFERENCES socios(id),
  fecha_hora TEXT NOT NULL,
  metodo TEXT NOT NULL DEFAULT 'qr'
);
";

const BACKUP_CONFIG_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS {table} (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  frecuencia TEXT NOT NULL DEFAULT 'diario' CHECK (frecuencia IN ('diario','semanal','mensual')),
  hora TEXT NOT NULL DEFAULT '03:00',
  mantener_backups INTEGER NOT NULL DEFAULT 30,
  activo INTEGER NOT NULL DEFAULT 1,
  actualizado_en TEXT
);
";

const RESERVAS_INDEXES: &[&str] =
    &["CREATE INDEX IF NOT EXISTS idx_reservas_clase_fecha ON reservas(clase_id, fecha);"];
const ASISTENCIAS_INDEXES: &[&str] =
    &["CREATE INDEX IF NOT EXISTS idx_asistencias_socio ON asistencias(socio_id);"];
const CODIGO_ACCESO_INDEX_SQL: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_socios_codigo_acceso ON socios(codigo_acceso);";

type MigrationFn = fn(&Connection, &mut TokenGenerator) -> Result<(), StoreError>;

struct Migration {
    version: i64,
    name: &'static str,
    apply: MigrationFn,
}

const MIGRATIONS: &[Migration] = &[
    Migration { version: 1, name: "socios_expected_columns", apply: socios_expected_columns },
    Migration { version: 2, name: "clases_expected_columns", apply: clases_expected_columns },
    Migration { version: 3, name: "reservas_expected_columns", apply: reservas_expected_columns },
    Migration { version: 4, name: "create_core_tables", apply: create_core_tables },
    Migration { version: 5, name: "create_instructores", apply: create_instructores },
    Migration { version: 6, name: "create_backup_config", apply: create_backup_config },
    Migration { version: 7, name: "widen_usuarios_rol", apply: widen_usuarios_rol },
    Migration { version: 8, name: "widen_reservas_estado", apply: widen_reservas_estado },
    Migration { version: 9, name: "normalize_clases_instructor", apply: normalize_clases_instructor },
    Migration { version: 10, name: "backfill_codigo_acceso", apply: backfill_codigo_acceso },
    Migration { version: 11, name: "unique_codigo_acceso_index", apply: unique_codigo_acceso_index },
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMigration {
    pub version: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<PendingMigration>,
    /// Tables exist but no ledger has been written yet.
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub already_applied: Vec<String>,
    pub failed: Vec<MigrationFailure>,
}

impl MigrationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Brings a database of any historical shape up to the structure the rest of
/// the system expects, one ledgered migration at a time.
pub struct SchemaManager<'s> {
    store: &'s SnapshotStore,
    tokens: TokenGenerator,
}

impl<'s> SchemaManager<'s> {
    #[must_use]
    pub fn new(store: &'s SnapshotStore) -> Self {
        Self::with_token_generator(store, TokenGenerator::new())
    }

    #[must_use]
    pub fn with_token_generator(store: &'s SnapshotStore, tokens: TokenGenerator) -> Self {
        Self { store, tokens }
    }

    /// Report recorded and outstanding migrations without changing anything.
    ///
    /// # Errors
    /// Returns an error when the ledger or catalog cannot be read.
    pub fn status(&self) -> Result<SchemaStatus, StoreError> {
        let conn = self.store.conn();
        let applied = if table_exists(conn, "schema_migrations")? {
            let mut stmt = conn.prepare(
                "SELECT version, name, applied_at FROM schema_migrations ORDER BY version ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(AppliedMigration { version: row.get(0)?, name: row.get(1)?, applied_at: row.get(2)? })
            })?;
            let mut applied = Vec::new();
            for row in rows {
                applied.push(row?);
            }
            applied
        } else {
            Vec::new()
        };

        let recorded: BTreeSet<i64> = applied.iter().map(|migration| migration.version).collect();
        let pending = MIGRATIONS
            .iter()
            .filter(|migration| !recorded.contains(&migration.version))
            .map(|migration| PendingMigration { version: migration.version, name: migration.name.to_string() })
            .collect();

        let inferred_from_legacy = applied.is_empty() && has_user_tables(conn)?;

        Ok(SchemaStatus {
            current_version: recorded.last().copied().unwrap_or(0),
            target_version: MIGRATIONS.last().map_or(0, |migration| migration.version),
            applied,
            pending,
            inferred_from_legacy,
        })
    }

    /// Run every migration not yet in the ledger, in order.
    ///
    /// A migration that succeeds, or fails only because its effect is already
    /// present, is recorded and the snapshot saved. Any other failure is
    /// logged and left unrecorded so the next start retries it; the run moves
    /// on to the next migration. Nothing is written when nothing is pending.
    ///
    /// # Errors
    /// Returns an error only when the ledger itself cannot be read or
    /// written, or a snapshot save fails.
    pub fn apply_pending(&mut self) -> Result<MigrationReport, StoreError> {
        self.apply_from(MIGRATIONS)
    }

    fn apply_from(&mut self, migrations: &[Migration]) -> Result<MigrationReport, StoreError> {
        let conn = self.store.conn();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let recorded = recorded_versions(conn)?;

        let mut report = MigrationReport::default();
        for migration in migrations.iter().filter(|migration| !recorded.contains(&migration.version)) {
            match (migration.apply)(conn, &mut self.tokens) {
                Ok(()) => {
                    record_migration(conn, migration)?;
                    self.store.save()?;
                    info!("applied migration {:03} {}", migration.version, migration.name);
                    report.applied.push(migration.name.to_string());
                }
                Err(err) if err.is_already_applied() => {
                    record_migration(conn, migration)?;
                    self.store.save()?;
                    info!("migration {:03} {} was already applied: {err}", migration.version, migration.name);
                    report.already_applied.push(migration.name.to_string());
                }
                Err(err) => {
                    let err = step_failure(migration.name, err);
                    if matches!(err, StoreError::ConstraintRebuildFailed { .. }) {
                        error!("migration {:03} {} left the old schema in place: {err}", migration.version, migration.name);
                    } else {
                        warn!("migration {:03} {} failed, retrying on next start: {err}", migration.version, migration.name);
                    }
                    report.failed.push(MigrationFailure { name: migration.name.to_string(), error: err.to_string() });
                }
            }
        }

        if report.applied.is_empty() && report.already_applied.is_empty() && report.failed.is_empty() {
            debug!("schema is up to date");
        }
        Ok(report)
    }
}

fn step_failure(name: &str, err: StoreError) -> StoreError {
    match err {
        StoreError::ConstraintRebuildFailed { .. } | StoreError::MigrationStepFailed { .. } => err,
        other => StoreError::MigrationStepFailed { name: name.to_string(), message: other.to_string() },
    }
}

fn recorded_versions(conn: &Connection) -> Result<BTreeSet<i64>, StoreError> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut versions = BTreeSet::new();
    for row in rows {
        versions.insert(row?);
    }
    Ok(versions)
}

fn record_migration(conn: &Connection, migration: &Migration) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![migration.version, migration.name, now_rfc3339()?],
    )?;
    Ok(())
}

fn has_user_tables(conn: &Connection) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> 'schema_migrations'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn table_sql(definition: &str, table: &str) -> String {
    definition.replace("{table}", table)
}

/// Add whichever of `columns` an existing `table` lacks. A missing table is
/// left for the create migrations, which define it with every column.
fn add_expected_columns(conn: &Connection, table: &str, columns: &[(&str, &str)]) -> Result<(), StoreError> {
    if !table_exists(conn, table)? {
        debug!("{table} does not exist yet, nothing to extend");
        return Ok(());
    }

    for (column, declaration) in columns {
        if table_has_column(conn, table, column)? {
            continue;
        }
        match conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {declaration};")) {
            Ok(()) => info!("added column {table}.{column}"),
            Err(err) => {
                let err = StoreError::from(err);
                if !err.is_already_applied() {
                    return Err(err);
                }
                debug!("column {table}.{column} already present: {err}");
            }
        }
    }
    Ok(())
}

fn socios_expected_columns(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    add_expected_columns(
        conn,
        "socios",
        &[("telefono", "TEXT"), ("fecha_vencimiento", "TEXT"), ("codigo_acceso", "TEXT")],
    )
}

fn clases_expected_columns(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    add_expected_columns(
        conn,
        "clases",
        &[("instructor_id", "INTEGER REFERENCES instructores(id)"), ("cupo_maximo", "INTEGER DEFAULT 20")],
    )
}

fn reservas_expected_columns(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    add_expected_columns(conn, "reservas", &[("creado_en", "TEXT")])
}

fn create_core_tables(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    let tx = conn.unchecked_transaction()?;
    for (definition, table) in [
        (USUARIOS_TABLE, "usuarios"),
        (SOCIOS_TABLE, "socios"),
        (CLASES_TABLE, "clases"),
        (RESERVAS_TABLE, "reservas"),
        (ASISTENCIAS_TABLE, "asistencias"),
    ] {
        tx.execute_batch(&table_sql(definition, table))?;
    }
    for index in RESERVAS_INDEXES.iter().chain(ASISTENCIAS_INDEXES) {
        tx.execute_batch(index)?;
    }
    tx.commit()?;
    Ok(())
}

fn create_instructores(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    conn.execute_batch(&table_sql(INSTRUCTORES_TABLE, "instructores"))?;
    Ok(())
}

fn create_backup_config(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&table_sql(BACKUP_CONFIG_TABLE, "backup_config"))?;
    tx.execute(
        "INSERT OR IGNORE INTO backup_config(id, frecuencia, hora, mantener_backups, activo, actualizado_en)
         VALUES (1, 'diario', '03:00', 30, 1, ?1)",
        params![now_rfc3339()?],
    )?;
    tx.commit()?;
    Ok(())
}

/// Probe `table.column` with a value only the widened constraint allows and
/// rebuild the table when the probe hits the old `CHECK`.
fn widen_check(
    conn: &Connection,
    table: &str,
    column: &str,
    probe: &str,
    definition: &str,
    indexes: &[&str],
) -> Result<(), StoreError> {
    if !table_exists(conn, table)? {
        debug!("{table} does not exist yet, nothing to widen");
        return Ok(());
    }
    if accepts_value(conn, table, column, probe)? {
        debug!("{table}.{column} already accepts {probe:?}");
        return Ok(());
    }

    let rebuild = ShadowRebuild { table, definition, indexes };
    match rebuild_table(conn, &rebuild) {
        Ok(rows) => {
            info!("rebuilt {table} to widen {column}, {rows} rows carried over");
            Ok(())
        }
        Err(err @ StoreError::ConstraintRebuildFailed { .. }) => Err(err),
        Err(err) => Err(StoreError::ConstraintRebuildFailed { table: table.to_string(), message: err.to_string() }),
    }
}

fn widen_usuarios_rol(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    widen_check(conn, "usuarios", "rol", "instructor", USUARIOS_TABLE, &[])
}

fn widen_reservas_estado(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    widen_check(conn, "reservas", "estado", "asistio", RESERVAS_TABLE, RESERVAS_INDEXES)
}

/// Replace free-text `clases.instructor` with a reference to `instructores`,
/// matching lookup rows on the derived key so repeated runs never duplicate
/// them. Rows already carrying `instructor_id` are left alone.
fn normalize_clases_instructor(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    if !table_has_column(conn, "clases", "instructor")? {
        debug!("clases has no free-text instructor column, nothing to normalize");
        return Ok(());
    }
    if !table_has_column(conn, "clases", "instructor_id")? || !table_exists(conn, "instructores")? {
        return Err(StoreError::MigrationStepFailed {
            name: "normalize_clases_instructor".to_string(),
            message: "clases.instructor_id or instructores is not present yet".to_string(),
        });
    }

    let tx = conn.unchecked_transaction()?;
    let names = {
        let mut stmt = tx.prepare(
            "SELECT DISTINCT instructor FROM clases
             WHERE instructor IS NOT NULL AND TRIM(instructor) <> '' AND instructor_id IS NULL
             ORDER BY instructor ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        names
    };

    let mut created = 0_usize;
    let mut linked = 0_usize;
    for name in &names {
        let key = derive_instructor_key(name);
        let existing: Option<i64> = tx
            .query_row("SELECT id FROM instructores WHERE email = ?1", params![key], |row| row.get(0))
            .optional()?;
        let instructor_id = if let Some(id) = existing {
            id
        } else {
            tx.execute(
                "INSERT INTO instructores(nombre, email, activo, creado_en) VALUES (?1, ?2, 1, ?3)",
                params![name.trim(), key, now_rfc3339()?],
            )?;
            created += 1;
            tx.last_insert_rowid()
        };
        linked += tx.execute(
            "UPDATE clases SET instructor_id = ?1 WHERE instructor = ?2 AND instructor_id IS NULL",
            params![instructor_id, name],
        )?;
    }
    tx.commit()?;

    if !names.is_empty() {
        info!("normalized clases.instructor: {created} instructores created, {linked} clases linked");
    }
    Ok(())
}

/// Give every socio with a missing, malformed, or duplicated check-in token
/// a fresh one. The lowest id keeps a shared token.
fn backfill_codigo_acceso(conn: &Connection, tokens: &mut TokenGenerator) -> Result<(), StoreError> {
    if !table_has_column(conn, "socios", "codigo_acceso")? {
        return Err(StoreError::MigrationStepFailed {
            name: "backfill_codigo_acceso".to_string(),
            message: "socios.codigo_acceso is not present yet".to_string(),
        });
    }

    let tx = conn.unchecked_transaction()?;
    let ids = {
        let mut stmt = tx.prepare(
            "SELECT id FROM socios
             WHERE codigo_acceso IS NULL
                OR LENGTH(codigo_acceso) <> 6
                OR codigo_acceso GLOB '*[^0-9]*'
             UNION
             SELECT later.id FROM socios AS later
             JOIN socios AS earlier
               ON earlier.codigo_acceso = later.codigo_acceso AND earlier.id < later.id
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        ids
    };

    for id in &ids {
        tokens.assign(&tx, "socios", "codigo_acceso", *id)?;
    }
    tx.commit()?;

    if !ids.is_empty() {
        info!("assigned fresh codigo_acceso to {} socios", ids.len());
    }
    Ok(())
}

fn unique_codigo_acceso_index(conn: &Connection, _: &mut TokenGenerator) -> Result<(), StoreError> {
    conn.execute_batch(CODIGO_ACCESO_INDEX_SQL)?;
    Ok(())
}
