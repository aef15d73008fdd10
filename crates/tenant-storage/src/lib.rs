//! Tenant database client abstraction for the Tenant Runtime Core.
//!
//! This crate defines the [`TenantDbClient`] trait — a thin, pluggable
//! interface the Connection Manager (`tenant-server`) uses to talk to a
//! specific tenant's database without knowing which engine backs it.
//! It knows nothing about credential decryption, caching, or the master
//! registry — those live in `tenant-core` and `tenant-server`.
//!
//! Two real implementations are provided:
//!
//! - [`PostgresTenantClient`] — for `database_type` `postgresql` and
//!   `supabase` (Supabase is hosted Postgres; it speaks the same wire
//!   protocol and is handled by the same backend).
//! - [`MysqlTenantClient`] — for `database_type` `mysql`.
//!
//! [`MemoryTenantClient`] is a fake used by tests that don't need a real
//! database.

mod error;
mod memory;
#[cfg(feature = "mysql-backend")]
mod mysql_client;
#[cfg(feature = "postgres-backend")]
mod postgres_client;

pub use error::StorageError;
pub use memory::MemoryTenantClient;
#[cfg(feature = "mysql-backend")]
pub use mysql_client::MysqlTenantClient;
#[cfg(feature = "postgres-backend")]
pub use postgres_client::PostgresTenantClient;

/// The canonical set of tables a healthy, provisioned tenant database must
/// have. Used by the health probe (C5) to distinguish `empty` from
/// `unreachable`.
pub const CANONICAL_TABLES: &[&str] = &["stores", "products", "categories", "users"];

/// A live, validated client to a single tenant's database.
///
/// Implementations must be safe to share across async tasks (`Send +
/// Sync`) since the Connection Manager caches one client per `store_id`
/// behind an `Arc` and hands out clones of that `Arc` to every caller.
#[async_trait::async_trait]
pub trait TenantDbClient: Send + Sync + 'static {
    /// Minimum round-trip health check (a `select 1` equivalent).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unreachable`] if the connection cannot be
    /// used within the given timeout, [`StorageError::Timeout`] if the
    /// probe itself times out.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Check whether a table exists in the tenant database's default
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unreachable`] if the query cannot be
    /// executed.
    async fn table_exists(&self, table: &str) -> Result<bool, StorageError>;

    /// Execute a single migration or seed statement batch as one
    /// transaction.
    ///
    /// Callers are responsible for making the SQL itself idempotent
    /// (`IF NOT EXISTS`, `ON CONFLICT DO UPDATE`, guarded `DO $$` blocks);
    /// this method only guarantees atomicity of the batch.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Migration`] if any statement in the batch
    /// fails; the transaction is rolled back.
    async fn execute_batch(&self, sql: &str) -> Result<(), StorageError>;

    /// Which of the [`CANONICAL_TABLES`] are present in the tenant
    /// database right now.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unreachable`] if the check cannot be
    /// performed.
    async fn canonical_tables_present(&self) -> Result<Vec<String>, StorageError> {
        let mut present = Vec::with_capacity(CANONICAL_TABLES.len());
        for table in CANONICAL_TABLES {
            if self.table_exists(table).await? {
                present.push((*table).to_owned());
            }
        }
        Ok(present)
    }
}
