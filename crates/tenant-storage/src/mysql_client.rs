//! MySQL tenant database client.

use std::time::Duration;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

use crate::{StorageError, TenantDbClient};

const PING_TIMEOUT: Duration = Duration::from_secs(3);

/// A tenant database client backed by a MySQL connection pool.
pub struct MysqlTenantClient {
    pool: MySqlPool,
}

impl MysqlTenantClient {
    /// Connect to a tenant's MySQL database.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unreachable`] if the pool cannot be
    /// established within [`PING_TIMEOUT`].
    pub async fn connect(connection_url: &str) -> Result<Self, StorageError> {
        let pool = tokio::time::timeout(
            PING_TIMEOUT,
            MySqlPoolOptions::new()
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

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TenantDbClient for MysqlTenantClient {
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
            r"SELECT COUNT(*) AS present FROM information_schema.tables
              WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Unreachable {
            reason: e.to_string(),
        })?;

        let count: i64 = row.try_get("present").map_err(|e| StorageError::Unreachable {
            reason: e.to_string(),
        })?;
        Ok(count > 0)
    }

    async fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Migration {
                reason: e.to_string(),
            })?;

        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed)
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Migration {
                    reason: format!("{e} (statement: {trimmed})"),
                })?;
        }

        tx.commit().await.map_err(|e| StorageError::Migration {
            reason: e.to_string(),
        })
    }
}
