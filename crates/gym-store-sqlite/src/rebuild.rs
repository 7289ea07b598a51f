use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::error::{is_check_violation, is_unique_violation};
use crate::introspect::{
    ensure_identifier, quote_identifier, row_count, table_columns, table_indexes, ColumnInfo,
};
use crate::snapshot::foreign_key_violations;
use crate::StoreError;

const TABLE_PLACEHOLDER: &str = "{table}";
const PROBE_TEXT: &str = "__probe__";

/// Target shape of a table whose constraints cannot be altered in place.
pub(crate) struct ShadowRebuild<'a> {
    pub table: &'a str,
    /// `CREATE TABLE {table} (...)` with the name left as a placeholder.
    pub definition: &'a str,
    /// Indexes the rebuilt table must carry. Each is `IF NOT EXISTS`.
    pub indexes: &'a [&'a str],
}

/// Swap `rebuild.table` for a freshly defined copy holding the same rows.
///
/// Runs with foreign keys suspended inside one transaction. The shadow copy
/// keeps every legacy column the new definition lacks, row counts are
/// compared before the original is dropped, and any failure rolls the whole
/// swap back so the original table stays untouched. Returns the number of
/// rows carried over.
pub(crate) fn rebuild_table(conn: &Connection, rebuild: &ShadowRebuild<'_>) -> Result<i64, StoreError> {
    let table = ensure_identifier(rebuild.table)?;
    let shadow = format!("{table}__shadow");

    with_foreign_keys_off(conn, || {
        let tx = conn.unchecked_transaction()?;
        let original_indexes = table_indexes(&tx, table)?;

        tx.execute_batch(&format!("DROP TABLE IF EXISTS {shadow};"))?;
        tx.execute_batch(&rebuild.definition.replace(TABLE_PLACEHOLDER, &shadow))?;

        let old_columns = table_columns(&tx, table)?;
        let new_columns = table_columns(&tx, &shadow)?;
        for legacy in old_columns
            .iter()
            .filter(|old| !new_columns.iter().any(|new| new.name == old.name))
        {
            tx.execute_batch(&format!(
                "ALTER TABLE {shadow} ADD COLUMN {} {};",
                quote_identifier(&legacy.name),
                legacy.decl_type
            ))?;
        }

        let column_list =
            old_columns.iter().map(|column| quote_identifier(&column.name)).collect::<Vec<_>>().join(", ");
        tx.execute_batch(&format!(
            "INSERT INTO {shadow} ({column_list}) SELECT {column_list} FROM {table};"
        ))?;

        let copied = row_count(&tx, &shadow)?;
        let expected = row_count(&tx, table)?;
        if copied != expected {
            return Err(StoreError::ConstraintRebuildFailed {
                table: table.to_string(),
                message: format!("copied {copied} rows, expected {expected}"),
            });
        }

        tx.execute_batch(&format!("DROP TABLE {table}; ALTER TABLE {shadow} RENAME TO {table};"))?;
        for (_, sql) in &original_indexes {
            tx.execute_batch(sql)?;
        }
        for sql in rebuild.indexes {
            tx.execute_batch(sql)?;
        }

        let violations = foreign_key_violations(&tx, Some(table))?;
        if !violations.is_empty() {
            return Err(StoreError::ConstraintRebuildFailed {
                table: table.to_string(),
                message: format!("{} foreign key violations after rebuild", violations.len()),
            });
        }

        tx.commit()?;
        Ok(copied)
    })
}

/// Whether `table` accepts `value` in `column` under its current constraints.
///
/// Inserts a throwaway row inside a savepoint that is always rolled back.
/// Other `NOT NULL` columns without a default receive placeholder values and
/// foreign keys are suspended, so only a `CHECK` failure yields `false`;
/// a placeholder colliding with an existing unique value still counts as
/// accepted.
pub(crate) fn accepts_value(
    conn: &Connection,
    table: &str,
    column: &str,
    value: &str,
) -> Result<bool, StoreError> {
    let table = ensure_identifier(table)?;
    let columns = table_columns(conn, table)?;

    let mut names = Vec::new();
    let mut values = Vec::new();
    for info in &columns {
        if info.name == column {
            names.push(quote_identifier(&info.name));
            values.push(Value::Text(value.to_string()));
        } else if info.not_null && info.default_value.is_none() && !info.primary_key {
            names.push(quote_identifier(&info.name));
            values.push(placeholder_for(info));
        }
    }
    if !columns.iter().any(|info| info.name == column) {
        return Err(StoreError::InvalidIdentifier(format!("{table}.{column}")));
    }

    let marks = (1..=values.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO {table} ({}) VALUES ({marks})", names.join(", "));

    with_foreign_keys_off(conn, || {
        conn.execute_batch("SAVEPOINT constraint_probe;")?;
        let outcome = conn.execute(&sql, params_from_iter(values.iter()));
        conn.execute_batch("ROLLBACK TO constraint_probe; RELEASE constraint_probe;")?;
        match outcome {
            Ok(_) => Ok(true),
            Err(err) if is_check_violation(&err) => Ok(false),
            // SQLite evaluates CHECK constraints before uniqueness, so a
            // duplicate key means the value itself was accepted.
            Err(err) if is_unique_violation(&err) => Ok(true),
            Err(err) => Err(err.into()),
        }
    })
}

/// Run `work` with `PRAGMA foreign_keys` off, restoring the previous setting
/// afterwards whether or not `work` succeeded. Must not be called inside an
/// open transaction, where the pragma is a no-op.
pub(crate) fn with_foreign_keys_off<T>(
    conn: &Connection,
    work: impl FnOnce() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let enabled: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA foreign_keys = OFF;")?;
    let outcome = work();
    if enabled != 0 {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    }
    outcome
}

fn placeholder_for(info: &ColumnInfo) -> Value {
    let decl = info.decl_type.to_ascii_uppercase();
    if decl.contains("INT") {
        Value::Integer(0)
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        Value::Real(0.0)
    } else {
        Value::Text(PROBE_TEXT.to_string())
    }
}
