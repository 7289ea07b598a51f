use gym_store_core::{fallback_token, TOKEN_MAX, TOKEN_MIN};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::{params, Connection};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::is_unique_violation;
use crate::introspect::ensure_identifier;
use crate::{SnapshotStore, StoreError};

const MAX_ATTEMPTS: usize = 100;

/// Draws six-digit check-in tokens that are not yet present in a column.
pub struct TokenGenerator {
    rng: StdRng,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    #[must_use]
    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng }
    }

    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Draw a token absent from `table.column`.
    ///
    /// Gives up after 100 colliding draws and returns the last six digits
    /// of the millisecond clock instead, which may itself collide.
    ///
    /// # Errors
    /// Returns an error when the identifiers are invalid or the lookup fails.
    pub fn generate(&mut self, conn: &Connection, table: &str, column: &str) -> Result<String, StoreError> {
        let table = ensure_identifier(table)?;
        let column = ensure_identifier(column)?;
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE {column} = ?1)");

        for _ in 0..MAX_ATTEMPTS {
            let candidate = self.rng.gen_range(TOKEN_MIN..=TOKEN_MAX).to_string();
            let taken: i64 = conn.query_row(&sql, params![candidate], |row| row.get(0))?;
            if taken == 0 {
                return Ok(candidate);
            }
        }

        let fallback = fallback_token(OffsetDateTime::now_utc());
        warn!("no free token in {table}.{column} after {MAX_ATTEMPTS} draws, using clock fallback {fallback}");
        Ok(fallback)
    }

    /// Generate a token and write it to row `row_id`, retrying with a fresh
    /// value whenever the column's unique constraint rejects it. Does not
    /// persist; see [`TokenGenerator::assign_persisted`].
    ///
    /// # Errors
    /// Returns [`StoreError::UniqueCollision`] when every retry collides.
    pub fn assign(
        &mut self,
        conn: &Connection,
        table: &str,
        column: &str,
        row_id: i64,
    ) -> Result<String, StoreError> {
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE id = ?2",
            ensure_identifier(table)?,
            ensure_identifier(column)?
        );

        for attempt in 1..=MAX_ATTEMPTS {
            let token = self.generate(conn, table, column)?;
            match conn.execute(&sql, params![token, row_id]) {
                Ok(_) => return Ok(token),
                Err(err) if is_unique_violation(&err) => {
                    debug!("token {token} collided on {table}.{column} (attempt {attempt})");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(StoreError::UniqueCollision(format!(
            "{table}.{column} rejected {MAX_ATTEMPTS} generated tokens for row {row_id}"
        )))
    }

    /// [`TokenGenerator::assign`] followed by a snapshot save.
    ///
    /// # Errors
    /// Same as [`TokenGenerator::assign`], plus persistence failures.
    pub fn assign_persisted(
        &mut self,
        store: &SnapshotStore,
        table: &str,
        column: &str,
        row_id: i64,
    ) -> Result<String, StoreError> {
        let token = self.assign(store.conn(), table, column, row_id)?;
        store.save()?;
        Ok(token)
    }
}
