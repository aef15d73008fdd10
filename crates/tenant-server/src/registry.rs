//! Master Registry (C2) — Postgres-backed CRUD over `stores`,
//! `store_databases`, `store_hostnames`, and `integration_tokens`.
//!
//! Every function takes a `&PgPool` and returns `Result<T, RegistryError>`,
//! following the `cloud::repository` pattern of the teacher: parameterized
//! `sqlx::query_as` calls, no hand-built SQL strings, one function per
//! operation. Credential fields round-trip through the vault (C1) at the
//! call site — this module only ever sees already-encrypted blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use tenant_core::vault::{CipherBlob, Vault};

/// Errors from the Master Registry (C2).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("store not found: {0}")]
    StoreNotFound(Uuid),

    #[error("store database not configured for store {0}")]
    NoDatabaseConfigured(Uuid),

    #[error("slug '{0}' is already taken")]
    SlugConflict(String),

    #[error("slug '{0}' is invalid: must be lowercase and match [a-z0-9-]+")]
    InvalidSlug(String),

    #[error("hostname '{0}' is already bound to another store")]
    HostnameConflict(String),

    #[error("vault error: {0}")]
    Vault(#[from] tenant_core::error::VaultError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A store's lifecycle status, stored as `stores.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    PendingDatabase,
    Provisioning,
    Active,
    Demo,
    Suspended,
    Inactive,
}

/// The `stores` row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Store {
    pub id: Uuid,
    pub slug: String,
    pub user_id: Uuid,
    pub status: StoreStatus,
    pub is_active: bool,
    pub published: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Whether this store may serve storefront traffic right now.
    #[must_use]
    pub fn serves_storefront(&self) -> bool {
        self.published && matches!(self.status, StoreStatus::Active)
    }
}

/// `database_type` discriminant for [`StoreDatabase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    Supabase,
    Postgresql,
    Mysql,
}

/// Connection health as last observed, stored as `store_databases.connection_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Failed,
    Timeout,
}

/// The `store_databases` row. `connection_string_encrypted` is a
/// base64-encoded [`CipherBlob`] (see [`Vault::wrap`]/[`Vault::unwrap`]).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoreDatabase {
    pub id: Uuid,
    pub store_id: Uuid,
    pub database_type: DatabaseType,
    pub connection_string_encrypted: String,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub database_name: Option<String>,
    pub connection_status: ConnectionStatus,
    pub last_connection_test: Option<DateTime<Utc>>,
    pub is_primary: bool,
}

/// Decrypted credentials returned by [`get_primary_database`]. Callers
/// must treat `connection_string` as secret — never log it, never include
/// it in an error payload.
#[derive(Debug, Clone)]
pub struct DecryptedDatabase {
    pub database_type: DatabaseType,
    pub connection_string: String,
    pub connection_status: ConnectionStatus,
}

/// The `store_hostnames` row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoreHostname {
    pub id: Uuid,
    pub hostname: String,
    pub store_id: Uuid,
    pub slug: String,
    pub is_primary: bool,
    pub is_custom_domain: bool,
    pub ssl_enabled: bool,
}

/// Extract the routing slug from a hostname: the first DNS label, or the
/// second if the first is `www`.
///
/// `resolve_slug_from_hostname("www.shop.example")` -> `"shop"`.
/// `resolve_slug_from_hostname("shop.example")` -> `"shop"`.
#[must_use]
pub fn slug_from_hostname(hostname: &str) -> String {
    let lower = hostname.to_lowercase();
    let mut labels = lower.split('.');
    match labels.next() {
        Some("www") => labels.next().unwrap_or("www").to_owned(),
        Some(first) => first.to_owned(),
        None => lower,
    }
}

// ── Stores ───────────────────────────────────────────────────────────

/// Whether `slug` is lowercase and matches `[a-z0-9-]+`, per `spec.md`
/// §3's `Store.slug` invariant.
#[must_use]
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Create a store in `pending_database`, `is_active = false`.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidSlug`] if `slug` isn't lowercase
/// `[a-z0-9-]+`, or [`RegistryError::SlugConflict`] if it's already taken.
pub async fn create_store(pool: &PgPool, owner_id: Uuid, slug: &str) -> Result<Store, RegistryError> {
    if !is_valid_slug(slug) {
        return Err(RegistryError::InvalidSlug(slug.to_owned()));
    }
    sqlx::query_as::<_, Store>(
        r"INSERT INTO stores (slug, user_id, status, is_active, published)
          VALUES ($1, $2, 'pending_database', false, false)
          RETURNING *",
    )
    .bind(slug)
    .bind(owner_id)
    .fetch_one(pool)
    .await
    .map_err(|e| map_unique_violation(e, || RegistryError::SlugConflict(slug.to_owned())))
}

/// Fetch a store by id.
///
/// # Errors
///
/// Returns [`RegistryError::StoreNotFound`] if no such store exists.
pub async fn get_store(pool: &PgPool, store_id: Uuid) -> Result<Store, RegistryError> {
    sqlx::query_as::<_, Store>("SELECT * FROM stores WHERE id = $1")
        .bind(store_id)
        .fetch_optional(pool)
        .await?
        .ok_or(RegistryError::StoreNotFound(store_id))
}

/// Update `status`, touching `updated_at`.
///
/// # Errors
///
/// Returns [`RegistryError::StoreNotFound`] if the store does not exist.
pub async fn set_store_status(
    pool: &PgPool,
    store_id: Uuid,
    status: StoreStatus,
) -> Result<(), RegistryError> {
    let result = sqlx::query("UPDATE stores SET status = $2, updated_at = now() WHERE id = $1")
        .bind(store_id)
        .bind(status)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(RegistryError::StoreNotFound(store_id));
    }
    Ok(())
}

/// Transition a store to `active` with `is_active = true`, as the final
/// step of repair/provisioning.
///
/// # Errors
///
/// Returns [`RegistryError::StoreNotFound`] if the store does not exist.
pub async fn mark_store_active(pool: &PgPool, store_id: Uuid) -> Result<(), RegistryError> {
    let result = sqlx::query(
        r"UPDATE stores SET status = 'active', is_active = true, updated_at = now() WHERE id = $1",
    )
    .bind(store_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(RegistryError::StoreNotFound(store_id));
    }
    Ok(())
}

// ── Store databases ─────────────────────────────────────────────────

/// Upsert the primary `StoreDatabase` for a store: encrypts `credentials`
/// through `vault`, marks the store `provisioning`, and demotes any prior
/// primary row in the same transaction.
///
/// # Errors
///
/// Returns [`RegistryError::Vault`] if encryption fails.
pub async fn attach_database(
    pool: &PgPool,
    vault: &Vault,
    store_id: Uuid,
    database_type: DatabaseType,
    credentials: &str,
    host: Option<&str>,
    port: Option<i32>,
    database_name: Option<&str>,
) -> Result<StoreDatabase, RegistryError> {
    let blob = vault.wrap(credentials.as_bytes())?.to_encoded();

    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE store_databases SET is_primary = false WHERE store_id = $1 AND is_primary")
        .bind(store_id)
        .execute(&mut *tx)
        .await?;

    let row = sqlx::query_as::<_, StoreDatabase>(
        r"INSERT INTO store_databases
            (store_id, database_type, connection_string_encrypted, host, port, database_name,
             connection_status, is_primary)
          VALUES ($1, $2, $3, $4, $5, $6, 'pending', true)
          RETURNING *",
    )
    .bind(store_id)
    .bind(database_type)
    .bind(&blob)
    .bind(host)
    .bind(port)
    .bind(database_name)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE stores SET status = 'provisioning', updated_at = now() WHERE id = $1")
        .bind(store_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(row)
}

/// Record the result of a connection health test against the primary
/// database row (used by the Connection Manager's build sequence).
///
/// # Errors
///
/// Returns [`RegistryError::Database`] on a query failure.
pub async fn record_connection_test(
    pool: &PgPool,
    store_id: Uuid,
    status: ConnectionStatus,
) -> Result<(), RegistryError> {
    sqlx::query(
        r"UPDATE store_databases
          SET connection_status = $2, last_connection_test = now()
          WHERE store_id = $1 AND is_primary",
    )
    .bind(store_id)
    .bind(status)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch and decrypt the primary database row for a store.
///
/// # Errors
///
/// Returns [`RegistryError::NoDatabaseConfigured`] if there is no active
/// primary row. Returns [`RegistryError::Vault`] if decryption fails.
pub async fn get_primary_database(
    pool: &PgPool,
    vault: &Vault,
    store_id: Uuid,
) -> Result<DecryptedDatabase, RegistryError> {
    let row = sqlx::query_as::<_, StoreDatabase>(
        "SELECT * FROM store_databases WHERE store_id = $1 AND is_primary",
    )
    .bind(store_id)
    .fetch_optional(pool)
    .await?
    .ok_or(RegistryError::NoDatabaseConfigured(store_id))?;

    let blob = CipherBlob::from_encoded(&row.connection_string_encrypted)
        .map_err(tenant_core::error::VaultError::from)?;
    let plaintext = vault.unwrap(&blob)?;
    let connection_string = String::from_utf8_lossy(&plaintext).into_owned();

    Ok(DecryptedDatabase {
        database_type: row.database_type,
        connection_string,
        connection_status: row.connection_status,
    })
}

/// Re-encrypt a store's primary database credentials under the vault's
/// current key version, without ever exposing the plaintext to the
/// caller. Used by a scheduled key-rotation maintenance job.
///
/// # Errors
///
/// Returns [`RegistryError::NoDatabaseConfigured`] if there is no primary
/// row. Returns [`RegistryError::Vault`] on a crypto failure.
pub async fn rewrap_database_credentials(
    pool: &PgPool,
    vault: &Vault,
    store_id: Uuid,
) -> Result<(), RegistryError> {
    let row = sqlx::query_as::<_, StoreDatabase>(
        "SELECT * FROM store_databases WHERE store_id = $1 AND is_primary",
    )
    .bind(store_id)
    .fetch_optional(pool)
    .await?
    .ok_or(RegistryError::NoDatabaseConfigured(store_id))?;

    let blob = CipherBlob::from_encoded(&row.connection_string_encrypted)
        .map_err(tenant_core::error::VaultError::from)?;
    let rewrapped = vault.rewrap(&blob)?;

    sqlx::query("UPDATE store_databases SET connection_string_encrypted = $2 WHERE id = $1")
        .bind(row.id)
        .bind(rewrapped.to_encoded())
        .execute(pool)
        .await?;
    Ok(())
}

// ── Hostnames ────────────────────────────────────────────────────────

/// Look up the store bound to a hostname, case-insensitively.
///
/// # Errors
///
/// Returns `None` if no hostname row matches (caller maps to `NotFound`).
pub async fn find_store_by_hostname(
    pool: &PgPool,
    hostname: &str,
) -> Result<Option<StoreHostname>, RegistryError> {
    let row = sqlx::query_as::<_, StoreHostname>(
        "SELECT * FROM store_hostnames WHERE lower(hostname) = lower($1)",
    )
    .bind(hostname)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Bind a hostname to a store. If `is_primary`, demotes any existing
/// primary hostname for that store in the same transaction (§4.2 failure
/// policy: multi-row operations demote before promoting).
///
/// # Errors
///
/// Returns [`RegistryError::HostnameConflict`] if the hostname is bound to
/// a different store already.
pub async fn upsert_hostname(
    pool: &PgPool,
    store_id: Uuid,
    hostname: &str,
    slug: &str,
    is_primary: bool,
    is_custom_domain: bool,
) -> Result<StoreHostname, RegistryError> {
    let mut tx = pool.begin().await?;

    if is_primary {
        sqlx::query("UPDATE store_hostnames SET is_primary = false WHERE store_id = $1 AND is_primary")
            .bind(store_id)
            .execute(&mut *tx)
            .await?;
    }

    let row = sqlx::query_as::<_, StoreHostname>(
        r"INSERT INTO store_hostnames (hostname, store_id, slug, is_primary, is_custom_domain)
          VALUES ($1, $2, $3, $4, $5)
          ON CONFLICT (lower(hostname)) DO UPDATE SET
            store_id = EXCLUDED.store_id,
            slug = EXCLUDED.slug,
            is_primary = EXCLUDED.is_primary,
            is_custom_domain = EXCLUDED.is_custom_domain
          RETURNING *",
    )
    .bind(hostname)
    .bind(store_id)
    .bind(slug)
    .bind(is_primary)
    .bind(is_custom_domain)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| map_unique_violation(e, || RegistryError::HostnameConflict(hostname.to_owned())))?;

    tx.commit().await?;
    Ok(row)
}

fn map_unique_violation(err: sqlx::Error, on_conflict: impl FnOnce() -> RegistryError) -> RegistryError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return on_conflict();
        }
    }
    RegistryError::Database(err)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn slug_from_hostname_strips_www() {
        assert_eq!(slug_from_hostname("www.shop.example"), "shop");
        assert_eq!(slug_from_hostname("WWW.SHOP.EXAMPLE"), "shop");
    }

    #[test]
    fn slug_from_hostname_uses_first_label_when_not_www() {
        assert_eq!(slug_from_hostname("shop.example"), "shop");
    }

    #[test]
    fn slug_from_hostname_handles_bare_www() {
        assert_eq!(slug_from_hostname("www"), "www");
    }

    #[test]
    fn is_valid_slug_rejects_uppercase_and_punctuation() {
        assert!(is_valid_slug("my-shop-1"));
        assert!(!is_valid_slug("My-Shop"));
        assert!(!is_valid_slug("my_shop"));
        assert!(!is_valid_slug("my shop"));
        assert!(!is_valid_slug(""));
    }

    #[test]
    fn serves_storefront_requires_published_and_active() {
        let base = Store {
            id: Uuid::new_v4(),
            slug: "shop".to_owned(),
            user_id: Uuid::new_v4(),
            status: StoreStatus::Active,
            is_active: true,
            published: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(base.serves_storefront());

        let mut unpublished = base.clone();
        unpublished.published = false;
        assert!(!unpublished.serves_storefront());

        let mut suspended = base;
        suspended.status = StoreStatus::Suspended;
        assert!(!suspended.serves_storefront());
    }
}
