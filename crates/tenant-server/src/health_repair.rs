//! Health & Repair (C5) — probes a tenant database for the canonical
//! tables and, when they're missing, runs the bundled tenant migrations
//! and seed data to bring a freshly attached database up to a servable
//! shape.
//!
//! The repair sequence is the one piece of this crate with no direct
//! teacher analogue (the teacher never provisions a *tenant's* schema —
//! only its own). It's grounded in spec.md §7 directly: mark
//! `pending_database`, invalidate any cached connection, run migrations,
//! seed, then — and only then — mark `active`. No store is left
//! half-migrated and marked active.

use std::sync::Arc;

use uuid::Uuid;

use tenant_storage::{StorageError, TenantDbClient, CANONICAL_TABLES};

use crate::connection_manager::{ConnectionError, ConnectionManager};
use crate::registry::{self, RegistryError, StoreStatus};

/// Bundled tenant migration files, embedded at compile time in the order
/// they must run. `include_str!` keeps them inside the binary so a
/// deployed server never depends on a migrations directory existing on
/// disk at runtime.
const TENANT_MIGRATIONS: &[&str] = &[
    include_str!("../tenant_migrations/0001_core_tables.sql"),
    include_str!("../tenant_migrations/0002_cms_tables.sql"),
];

/// Outcome of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// All canonical tables present and the client responds to `ping`.
    Healthy,
    /// The client responds, but one or more canonical tables are missing
    /// — a fresh or partially provisioned database.
    Empty { tables_present: usize },
    /// The client could not be reached at all.
    Unreachable,
}

/// Errors from probing or repairing a tenant database.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("store not found: {0}")]
    NotFound(Uuid),

    #[error("tenant database error: {0}")]
    Storage(#[from] StorageError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("repair failed at step '{step}': {reason}")]
    RepairFailed { step: &'static str, reason: String },
}

/// Probe a store's tenant database and classify it as healthy, empty, or
/// unreachable. Does not mutate any state.
///
/// # Errors
///
/// Returns [`RepairError::Connection`] if no client could be built at all
/// (distinct from `Unreachable`, which means a client exists but its ping
/// failed).
pub async fn probe(manager: &ConnectionManager, store_id: Uuid) -> Result<HealthStatus, RepairError> {
    let handle = match manager.get(store_id).await {
        Ok(h) => h,
        Err(ConnectionError::NoDatabaseConfigured(id)) => return Err(RepairError::NotFound(id)),
        Err(e) => return Err(e.into()),
    };

    if handle.client.ping().await.is_err() {
        return Ok(HealthStatus::Unreachable);
    }

    let present = handle.client.canonical_tables_present().await?;
    if present.len() == CANONICAL_TABLES.len() {
        Ok(HealthStatus::Healthy)
    } else {
        Ok(HealthStatus::Empty { tables_present: present.len() })
    }
}

/// Run the full repair sequence for a store: mark `pending_database`,
/// invalidate any cached connection, apply the bundled tenant migrations,
/// seed minimal data, then mark the store `active`.
///
/// Nothing marks the store active until every step succeeds — a failure
/// midway leaves the store in `pending_database`, safe to retry.
///
/// # Errors
///
/// Returns [`RepairError::RepairFailed`] naming the step that failed.
pub async fn repair(
    pool: &sqlx::PgPool,
    manager: &ConnectionManager,
    store_id: Uuid,
    owner_email: &str,
) -> Result<(), RepairError> {
    registry::set_store_status(pool, store_id, StoreStatus::PendingDatabase).await?;
    manager.invalidate(store_id).await;

    let handle = manager.get(store_id).await?;

    run_migrations(&handle.client).await.map_err(|reason| RepairError::RepairFailed {
        step: "migrate",
        reason,
    })?;

    seed(&handle.client, store_id, owner_email)
        .await
        .map_err(|reason| RepairError::RepairFailed { step: "seed", reason })?;

    registry::mark_store_active(pool, store_id)
        .await
        .map_err(|e| RepairError::RepairFailed { step: "activate", reason: e.to_string() })?;

    tracing::info!(%store_id, "tenant database repaired and store activated");
    Ok(())
}

async fn run_migrations(client: &Arc<dyn TenantDbClient>) -> Result<(), String> {
    for (i, migration) in TENANT_MIGRATIONS.iter().enumerate() {
        client.execute_batch(migration).await.map_err(|e| format!("migration {i}: {e}"))?;
    }
    Ok(())
}

async fn seed(client: &Arc<dyn TenantDbClient>, store_id: Uuid, owner_email: &str) -> Result<(), String> {
    let sql = format!(
        r"INSERT INTO stores (name, slug) VALUES ('Default Store', 'default')
          ON CONFLICT (slug) DO NOTHING;
          INSERT INTO users (email, is_owner) VALUES ({owner_email}, true)
          ON CONFLICT (lower(email)) DO NOTHING;
          INSERT INTO translations (locale, namespace, strings) VALUES ('en', 'system', '{{}}'::jsonb)
          ON CONFLICT (locale, namespace) DO NOTHING;
          INSERT INTO themes (name, is_default) VALUES ('default', true)
          ON CONFLICT DO NOTHING;
          INSERT INTO email_templates (template_key, subject, body) VALUES ('welcome', 'Welcome', '{{}}'::jsonb)
          ON CONFLICT (template_key) DO NOTHING;",
        owner_email = sql_quote(owner_email),
    );
    client.execute_batch(&sql).await.map_err(|e| format!("store {store_id}: {e}"))
}

/// Escape a string for embedding as a SQL literal. [`TenantDbClient::execute_batch`]
/// takes raw SQL with no bind-parameter support, so seed statements that
/// interpolate dynamic values (an owner's email) must escape them by hand:
/// doubling embedded single quotes, the standard SQL-92 escape.
fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sql_quote_doubles_embedded_quotes() {
        assert_eq!(sql_quote("o'brien@example.com"), "'o''brien@example.com'");
        assert_eq!(sql_quote("plain@example.com"), "'plain@example.com'");
    }

    #[tokio::test]
    async fn probe_classifies_empty_vs_healthy() {
        let empty = tenant_storage::MemoryTenantClient::empty();
        let present = empty.canonical_tables_present().await.unwrap();
        assert!(present.is_empty());

        let provisioned = tenant_storage::MemoryTenantClient::provisioned();
        let present = provisioned.canonical_tables_present().await.unwrap();
        assert_eq!(present.len(), CANONICAL_TABLES.len());
    }

    #[tokio::test]
    async fn seed_statement_is_idempotent_shape() {
        let client: Arc<dyn TenantDbClient> = Arc::new(tenant_storage::MemoryTenantClient::empty());
        run_migrations(&client).await.unwrap();
        seed(&client, Uuid::new_v4(), "owner@example.com").await.unwrap();
        assert!(client.table_exists("users").await.unwrap());
    }
}
