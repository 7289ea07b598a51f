use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, DatabaseName, OptionalExtension, Params, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::StoreError;

const SQLITE_HEADER_LEN: usize = 100;

/// Owner of the single live database handle.
///
/// All state lives in an in-memory SQLite connection. Every mutating wrapper
/// serializes the whole database back to the bound file before returning, so
/// whenever no call is in flight the file mirrors the handle exactly.
pub struct SnapshotStore {
    conn: Connection,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
}

impl SnapshotStore {
    /// Load the database file at `path` into memory, or start empty when the
    /// file does not exist yet. Nothing is written until the first save.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read as a database.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_snapshot(&path)?;
        debug!("loaded database snapshot from {}", path.display());
        Ok(Self { conn, path: Some(path) })
    }

    /// Detached store with no backing file; saves are no-ops.
    ///
    /// # Errors
    /// Returns an error when the in-memory connection cannot be configured.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn, path: None })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Raw handle. Writes made through it reach the file only on the next
    /// [`SnapshotStore::save`].
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Serialize the entire database over the bound file.
    ///
    /// The snapshot is written to `<file>.tmp`, synced, then renamed into
    /// place, so a crash mid-write leaves the previous file intact.
    ///
    /// # Errors
    /// Returns [`StoreError::PersistenceWriteFailed`] when any step of the
    /// write fails. The in-memory state is then ahead of the file.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let failed = |message: String| StoreError::PersistenceWriteFailed {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| failed(format!("failed to create parent directory: {err}")))?;
        }

        let tmp = sibling_with_suffix(path, ".tmp");
        if tmp.exists() {
            fs::remove_file(&tmp)
                .map_err(|err| failed(format!("failed to clear stale {}: {err}", tmp.display())))?;
        }

        self.conn
            .backup(DatabaseName::Main, &tmp, None)
            .map_err(|err| failed(format!("failed to serialize snapshot: {err}")))?;
        File::open(&tmp)
            .and_then(|file| file.sync_all())
            .map_err(|err| failed(format!("failed to sync {}: {err}", tmp.display())))?;
        fs::rename(&tmp, path).map_err(|err| failed(format!("failed to replace live file: {err}")))?;

        debug!("saved database snapshot to {}", path.display());
        Ok(())
    }

    /// Replace the in-memory handle with the current contents of the bound
    /// file. Used after the file was overwritten out of band (restore).
    ///
    /// # Errors
    /// Returns [`StoreError::SourceMissing`] when the file is gone, or the
    /// underlying error when it cannot be read.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if !path.exists() {
            return Err(StoreError::SourceMissing(path.to_path_buf()));
        }

        self.conn = open_snapshot(path)?;
        debug!("reloaded database snapshot from {}", path.display());
        Ok(())
    }

    /// Run a statement and collect every mapped row. A statement that can
    /// write (e.g. `INSERT ... RETURNING`) is persisted before returning.
    ///
    /// # Errors
    /// Returns an error when the statement fails to prepare or a row fails to
    /// map, [`StoreError::UniqueCollision`] on a duplicate key, or the
    /// persistence error.
    pub fn query<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Vec<T>, StoreError>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let writes = !stmt.readonly();
        let mut values = Vec::new();
        for row in stmt.query_map(params, map).map_err(StoreError::from_write)? {
            values.push(row.map_err(StoreError::from_write)?);
        }
        drop(stmt);

        if writes {
            self.save()?;
        }
        Ok(values)
    }

    /// Run a statement and map the first row, if any. Writing statements are
    /// persisted before returning, as with [`SnapshotStore::query`].
    ///
    /// # Errors
    /// Returns an error when the statement fails or the row fails to map,
    /// [`StoreError::UniqueCollision`] on a duplicate key, or the persistence
    /// error.
    pub fn get<T, P, F>(&self, sql: &str, params: P, map: F) -> Result<Option<T>, StoreError>
    where
        P: Params,
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let writes = !stmt.readonly();
        let value = stmt.query_row(params, map).optional().map_err(StoreError::from_write)?;
        drop(stmt);

        if writes {
            self.save()?;
        }
        Ok(value)
    }

    /// Execute one mutating statement and persist. Returns the changed row count.
    ///
    /// # Errors
    /// Returns [`StoreError::UniqueCollision`] on a duplicate key, or the
    /// statement/persistence error.
    pub fn run<P: Params>(&self, sql: &str, params: P) -> Result<usize, StoreError> {
        let changed = self.conn.execute(sql, params).map_err(StoreError::from_write)?;
        self.save()?;
        Ok(changed)
    }

    /// Execute an `INSERT`, persist, and return the new row id.
    ///
    /// # Errors
    /// Same as [`SnapshotStore::run`].
    pub fn insert<P: Params>(&self, sql: &str, params: P) -> Result<i64, StoreError> {
        self.conn.execute(sql, params).map_err(StoreError::from_write)?;
        let row_id = self.conn.last_insert_rowid();
        self.save()?;
        Ok(row_id)
    }

    /// # Errors
    /// Returns an error when any statement in the batch fails or the save fails.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(sql).map_err(StoreError::from_write)?;
        self.save()
    }

    /// Run `work` inside one transaction; commit and persist only when it
    /// returns `Ok`.
    ///
    /// # Errors
    /// Returns the error produced by `work`, or the commit/persistence error.
    pub fn transaction<T, F>(&mut self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let tx = self.conn.transaction()?;
        let value = work(&tx)?;
        tx.commit()?;
        self.save()?;
        Ok(value)
    }

    /// Run `PRAGMA quick_check` and `PRAGMA foreign_key_check`.
    ///
    /// # Errors
    /// Returns an error when either probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let quick_check_message: String =
            self.conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        let foreign_key_violations = foreign_key_violations(&self.conn, None)?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
        })
    }
}

pub(crate) fn foreign_key_violations(
    conn: &Connection,
    table: Option<&str>,
) -> Result<Vec<ForeignKeyViolation>, StoreError> {
    let sql = match table {
        Some(table) => format!("PRAGMA foreign_key_check({})", crate::introspect::ensure_identifier(table)?),
        None => "PRAGMA foreign_key_check".to_string(),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?;

    let mut violations = Vec::new();
    for row in rows {
        violations.push(row?);
    }
    Ok(violations)
}

pub(crate) fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn open_snapshot(path: &Path) -> Result<Connection, StoreError> {
    let mut conn = Connection::open_in_memory()?;
    if path.exists() {
        // The backup API refuses to copy into an in-memory target whose page
        // size differs from the source file.
        if let Some(page_size) = read_page_size(path)? {
            conn.execute_batch(&format!("PRAGMA page_size = {page_size};"))?;
        }
        conn.restore(DatabaseName::Main, path, None::<fn(rusqlite::backup::Progress)>)?;
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Page size recorded in the database header (offset 16, big-endian; the
/// value 1 encodes 65536). `None` for files shorter than a header.
fn read_page_size(path: &Path) -> Result<Option<u32>, StoreError> {
    let mut header = [0_u8; SQLITE_HEADER_LEN];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < header.len() {
        let read = file.read(&mut header[filled..])?;
        if read == 0 {
            return Ok(None);
        }
        filled += read;
    }

    let raw = u16::from_be_bytes([header[16], header[17]]);
    Ok(match raw {
        1 => Some(65_536),
        0 => None,
        size => Some(u32::from(size)),
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use rusqlite::params;

    use super::*;

    const SOCIOS_SQL: &str = "CREATE TABLE socios (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        nombre TEXT NOT NULL,
        email TEXT UNIQUE
    )";

    fn store_in(dir: &tempfile::TempDir) -> Result<SnapshotStore> {
        Ok(SnapshotStore::load(dir.path().join("gym.db"))?)
    }

    #[test]
    fn load_without_file_starts_empty_and_writes_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir)?;
        let tables: i64 =
            store.conn().query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))?;
        assert_eq!(tables, 0);
        assert!(!dir.path().join("gym.db").exists());
        Ok(())
    }

    #[test]
    fn every_mutation_is_persisted_before_returning() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir)?;
        store.execute_batch(SOCIOS_SQL)?;
        let id = store.insert(
            "INSERT INTO socios(nombre, email) VALUES (?1, ?2)",
            params!["Ana", "ana@example.com"],
        )?;
        assert_eq!(id, 1);
        let changed = store.run("UPDATE socios SET nombre = ?1 WHERE id = ?2", params!["Ana María", id])?;
        assert_eq!(changed, 1);
        drop(store);

        let reopened = store_in(&dir)?;
        let nombre = reopened.get("SELECT nombre FROM socios WHERE id = ?1", params![id], |row| {
            row.get::<_, String>(0)
        })?;
        assert_eq!(nombre.as_deref(), Some("Ana María"));
        assert!(!dir.path().join("gym.db.tmp").exists());
        Ok(())
    }

    #[test]
    fn returning_statements_through_query_and_get_are_persisted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir)?;
        store.execute_batch(SOCIOS_SQL)?;

        let ids = store.query("INSERT INTO socios(nombre) VALUES ('Ana') RETURNING id", [], |row| {
            row.get::<_, i64>(0)
        })?;
        assert_eq!(ids, [1]);
        let renamed = store.get(
            "UPDATE socios SET nombre = 'Eva' WHERE id = ?1 RETURNING nombre",
            params![ids[0]],
            |row| row.get::<_, String>(0),
        )?;
        assert_eq!(renamed.as_deref(), Some("Eva"));
        drop(store);

        let reopened = store_in(&dir)?;
        let names = reopened.query("SELECT nombre FROM socios", [], |row| row.get::<_, String>(0))?;
        assert_eq!(names, ["Eva"]);
        Ok(())
    }

    #[test]
    fn read_only_queries_do_not_rewrite_the_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gym.db");
        let store = SnapshotStore::load(&path)?;
        store.execute_batch(SOCIOS_SQL)?;
        fs::remove_file(&path)?;

        let count = store.get("SELECT COUNT(*) FROM socios", [], |row| row.get::<_, i64>(0))?;
        assert_eq!(count, Some(0));
        store.query("SELECT nombre FROM socios", [], |row| row.get::<_, String>(0))?;
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn duplicate_keys_surface_as_unique_collision() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store_in(&dir)?;
        store.execute_batch(SOCIOS_SQL)?;
        store.insert("INSERT INTO socios(nombre, email) VALUES ('Ana', 'a@x')", [])?;

        let err = store.insert("INSERT INTO socios(nombre, email) VALUES ('Eva', 'a@x')", []);
        assert!(matches!(err, Err(StoreError::UniqueCollision(_))));
        Ok(())
    }

    #[test]
    fn failed_transaction_is_neither_committed_nor_saved() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = store_in(&dir)?;
        store.execute_batch(SOCIOS_SQL)?;
        let before = fs::read(dir.path().join("gym.db"))?;

        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.execute("INSERT INTO socios(nombre) VALUES ('Ana')", [])?;
            Err(StoreError::UniqueCollision("forced".to_string()))
        });
        assert!(result.is_err());

        let count = store.get("SELECT COUNT(*) FROM socios", [], |row| row.get::<_, i64>(0))?;
        assert_eq!(count, Some(0));
        assert_eq!(fs::read(dir.path().join("gym.db"))?, before);
        Ok(())
    }

    #[test]
    fn reload_picks_up_a_replaced_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gym.db");
        let mut store = SnapshotStore::load(&path)?;
        store.execute_batch(SOCIOS_SQL)?;

        let other = dir.path().join("other.db");
        {
            let conn = Connection::open(&other)?;
            conn.execute_batch(
                "CREATE TABLE socios (id INTEGER PRIMARY KEY, nombre TEXT NOT NULL, email TEXT UNIQUE);
                 INSERT INTO socios(nombre) VALUES ('Restaurada');",
            )?;
        }
        fs::copy(&other, &path)?;

        store.reload()?;
        let names = store.query("SELECT nombre FROM socios", [], |row| row.get::<_, String>(0))?;
        assert_eq!(names, ["Restaurada"]);

        let fk: i64 = store.conn().query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(fk, 1);
        Ok(())
    }

    #[test]
    fn reload_without_file_is_source_missing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = store_in(&dir)?;
        assert!(matches!(store.reload(), Err(StoreError::SourceMissing(_))));
        Ok(())
    }

    #[test]
    fn files_with_non_default_page_size_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gym.db");
        {
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                "PRAGMA page_size = 8192;
                 CREATE TABLE socios (id INTEGER PRIMARY KEY, nombre TEXT);
                 INSERT INTO socios(nombre) VALUES ('Ana');",
            )?;
        }
        assert_eq!(read_page_size(&path)?, Some(8192));

        let store = SnapshotStore::load(&path)?;
        let count = store.get("SELECT COUNT(*) FROM socios", [], |row| row.get::<_, i64>(0))?;
        assert_eq!(count, Some(1));
        Ok(())
    }

    #[test]
    fn in_memory_store_never_touches_disk() -> Result<()> {
        let store = SnapshotStore::in_memory()?;
        assert!(store.path().is_none());
        store.execute_batch(SOCIOS_SQL)?;
        store.save()?;
        assert!(store.integrity_check()?.quick_check_ok);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_orphaned_rows() -> Result<()> {
        let store = SnapshotStore::in_memory()?;
        store.execute_batch(
            "CREATE TABLE socios (id INTEGER PRIMARY KEY, nombre TEXT);
             CREATE TABLE asistencias (id INTEGER PRIMARY KEY, socio_id INTEGER REFERENCES socios(id));
             PRAGMA foreign_keys = OFF;
             INSERT INTO asistencias(socio_id) VALUES (42);
             PRAGMA foreign_keys = ON;",
        )?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert_eq!(report.foreign_key_violations.len(), 1);
        assert_eq!(report.foreign_key_violations[0].table, "asistencias");
        assert_eq!(report.foreign_key_violations[0].parent, "socios");
        Ok(())
    }
}
