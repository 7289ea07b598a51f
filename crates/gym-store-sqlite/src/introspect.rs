use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Tables and columns currently present in the database, inferred by
/// structural introspection rather than read from a version counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaState {
    pub tables: BTreeMap<String, Vec<String>>,
}

impl SchemaState {
    /// Every table and column in `earlier` is still present here.
    #[must_use]
    pub fn is_superset_of(&self, earlier: &Self) -> bool {
        earlier.tables.iter().all(|(table, columns)| {
            self.tables
                .get(table)
                .is_some_and(|present| columns.iter().all(|column| present.contains(column)))
        })
    }
}

/// Reject anything that is not a plain `[A-Za-z_][A-Za-z0-9_]*` identifier
/// before it is interpolated into SQL text.
pub(crate) fn ensure_identifier(value: &str) -> Result<&str, StoreError> {
    let mut chars = value.chars();
    let valid = chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(value)
    } else {
        Err(StoreError::InvalidIdentifier(value.to_string()))
    }
}

/// Double-quote a name read back from the catalog so it can be spliced into SQL.
pub(crate) fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

/// Column list of `table`; empty when the table does not exist.
pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
    let table = ensure_identifier(table)?;
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            not_null: row.get::<_, i64>(3)? != 0,
            default_value: row.get(4)?,
            primary_key: row.get::<_, i64>(5)? != 0,
        })
    })?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

pub(crate) fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, StoreError> {
    Ok(table_columns(conn, table)?.iter().any(|info| info.name == column))
}

pub(crate) fn row_count(conn: &Connection, table: &str) -> Result<i64, StoreError> {
    let table = ensure_identifier(table)?;
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
}

/// Names of the explicit indexes attached to `table`, with their DDL.
pub(crate) fn table_indexes(conn: &Connection, table: &str) -> Result<Vec<(String, String)>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT name, sql FROM sqlite_master
         WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL
         ORDER BY name ASC",
    )?;
    let rows = stmt.query_map(params![table], |row| Ok((row.get(0)?, row.get(1)?)))?;

    let mut indexes = Vec::new();
    for row in rows {
        indexes.push(row?);
    }
    Ok(indexes)
}

/// Snapshot the user tables (internal `sqlite_*` tables excluded) and their
/// columns.
///
/// # Errors
/// Returns an error when `sqlite_master` or `PRAGMA table_info` cannot be read.
pub fn schema_state(conn: &Connection) -> Result<SchemaState, StoreError> {
    let names = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        names
    };

    let mut tables = BTreeMap::new();
    for name in names {
        let columns = table_columns(conn, &name)?.into_iter().map(|info| info.name).collect();
        tables.insert(name, columns);
    }
    Ok(SchemaState { tables })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(ensure_identifier("socios").is_ok());
        assert!(ensure_identifier("_ledger_2").is_ok());
        assert!(ensure_identifier("").is_err());
        assert!(ensure_identifier("2fast").is_err());
        assert!(ensure_identifier("socios; DROP TABLE socios").is_err());
        assert!(ensure_identifier("codigo-acceso").is_err());
    }

    #[test]
    fn missing_tables_report_no_columns() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        assert!(!table_exists(&conn, "socios")?);
        assert!(table_columns(&conn, "socios")?.is_empty());
        assert!(!table_has_column(&conn, "socios", "codigo_acceso")?);
        Ok(())
    }

    #[test]
    fn column_metadata_is_read_from_table_info() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE clases (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               nombre TEXT NOT NULL,
               cupo_maximo INTEGER DEFAULT 20
             );
             CREATE INDEX idx_clases_nombre ON clases(nombre);",
        )?;

        let columns = table_columns(&conn, "clases")?;
        let names: Vec<&str> = columns.iter().map(|info| info.name.as_str()).collect();
        assert_eq!(names, ["id", "nombre", "cupo_maximo"]);
        assert!(columns[0].primary_key);
        assert!(columns[1].not_null);
        assert_eq!(columns[2].default_value.as_deref(), Some("20"));
        assert_eq!(columns[2].decl_type, "INTEGER");

        let indexes = table_indexes(&conn, "clases")?;
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].0, "idx_clases_nombre");
        Ok(())
    }

    #[test]
    fn schema_state_superset_tracks_dropped_columns() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE socios (id INTEGER PRIMARY KEY, nombre TEXT)")?;
        let before = schema_state(&conn)?;

        conn.execute_batch("ALTER TABLE socios ADD COLUMN telefono TEXT")?;
        let grown = schema_state(&conn)?;
        assert!(grown.is_superset_of(&before));
        assert!(!before.is_superset_of(&grown));
        assert!(!grown.tables.contains_key("sqlite_sequence"));
        Ok(())
    }
}
