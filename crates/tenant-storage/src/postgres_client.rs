//! PostgreSQL tenant database client.
//!
//! Used for `database_type` `postgresql` and `supabase` — Supabase is
//! hosted Postgres and speaks the same wire protocol, so it shares this
//! backend rather than getting its own client type.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::{StorageError, TenantDbClient};

/// Default timeout for the health probe.
const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// A tenant database client backed by a PostgreSQL connection pool.
pub struct PostgresTenantClient {
    pool: PgPool,
}

impl PostgresTenantClient {
    /// Connect to a tenant's Postgres (or Supabase) database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidConfig`] if the connection string is
    /// malformed, or [`StorageError::Unreachable`] if the pool cannot be
    /// established within [`PING_TIMEOUT`].
    pub async fn connect(connection_url: &str) -> Result<Self, StorageError> {
        let pool = tokio::time::timeout(
            PING_TIMEOUT,
            PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(PING_TIMEOUT)
                .connect(connection_url),
        )
        .await
        .map_err(|_| StorageError::Timeout {
            elapsed_ms: PING_TIMEOUT.as_millis() as u64,
        })?
        .map_err(|e| StorageError::Unreachable {
            reason: e.to_string(),
        })?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (used by tests and by callers that already
    /// manage pooling themselves).
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TenantDbClient for PostgresTenantClient {
    async fn ping(&self) -> Result<(), StorageError> {
        tokio::time::timeout(PING_TIMEOUT, sqlx::query("SELECT 1").execute(&self.pool))
            .await
            .map_err(|_| StorageError::Timeout {
                elapsed_ms: PING_TIMEOUT.as_millis() as u64,
            })?
            .map_err(|e| StorageError::Unreachable {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let row = sqlx::query(
            r"SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
              ) AS present",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Unreachable {
            reason: e.to_string(),
        })?;

        row.try_get::<bool, _>("present")
            .map_err(|e| StorageError::Unreachable {
                reason: e.to_string(),
            })
    }

    async fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Migration {
                reason: e.to_string(),
            })?;

        for statement in split_statements(sql) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Migration {
                    reason: format!("{e} (statement: {statement})"),
                })?;
        }

        tx.commit().await.map_err(|e| StorageError::Migration {
            reason: e.to_string(),
        })
    }
}

/// Split a migration file's SQL into individually executable statements.
///
/// `sqlx` does not execute multi-statement strings through `query()`;
/// callers must submit one statement at a time. `DO $$ ... $$;` blocks are
/// kept intact (the `$$` markers delimit a single statement even though it
/// contains semicolons inside).
fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut rest = sql;

    while let Some(pos) = find_statement_end(rest) {
        let (stmt, tail) = rest.split_at(pos + 1);
        let trimmed = stmt.trim();
        if !trimmed.is_empty() {
            statements.push(trimmed);
        }
        rest = tail;
    }

    let trimmed = rest.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed);
    }

    statements
}

fn find_statement_end(sql: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut in_dollar_block = false;
    let mut i = 0;
    while i < bytes.len() {
        if sql[i..].starts_with("$$") {
            in_dollar_block = !in_dollar_block;
            i += 2;
            continue;
        }
        if bytes[i] == b';' && !in_dollar_block {
            return Some(i);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn split_statements_respects_dollar_blocks() {
        let sql = "CREATE TABLE a (id int);\nDO $$ BEGIN CREATE TYPE x; EXCEPTION WHEN duplicate_object THEN null; END $$;\nALTER TABLE a ADD COLUMN b int;";
        let statements = split_statements(sql);
        assert_eq!(statements.len(), 3);
        assert!(statements[1].contains("EXCEPTION"));
    }

    #[test]
    fn split_statements_handles_trailing_statement_without_semicolon() {
        let statements = split_statements("SELECT 1;\nSELECT 2");
        assert_eq!(statements, vec!["SELECT 1;", "SELECT 2"]);
    }
}
