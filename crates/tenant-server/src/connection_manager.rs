//! Connection Manager (C4) — a process-wide cache of live
//! [`TenantDbClient`] handles keyed by `store_id`.
//!
//! Mirrors the teacher's `DatabaseEngine` cache: an `RwLock<HashMap<...>>`
//! read for the common hit path, built entries wrapped in `Arc` so callers
//! can hold a handle past the lock guard's lifetime. Unlike the teacher's
//! engines (constructed once at mount time) a tenant's client can be
//! invalidated and rebuilt at any point — by a failed health probe, a
//! credential rotation, or repair (C5) — so every cached entry carries a
//! `health_epoch` that [`ConnectionManager::invalidate`] bumps.
//!
//! Concurrent builds for the same `store_id` are coalesced through a
//! per-key async mutex (the pattern the OAuth broker uses to singleflight
//! concurrent refreshes of the same token): the first caller for a key
//! builds and populates the cache, later callers for the same key wait on
//! the same `Mutex` rather than racing a duplicate connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_lock::Mutex as AsyncMutex;
use tokio::sync::RwLock;
use uuid::Uuid;

use tenant_core::vault::Vault;
use tenant_storage::{MemoryTenantClient, MysqlTenantClient, PostgresTenantClient, StorageError, TenantDbClient};

use crate::registry::{self, ConnectionStatus, DatabaseType, RegistryError};

/// Errors from the Connection Manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no database configured for store {0}")]
    NoDatabaseConfigured(Uuid),

    #[error("could not connect to store {store_id}'s database: {reason}")]
    BuildFailed { store_id: Uuid, reason: String },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl From<StorageError> for ConnectionError {
    fn from(err: StorageError) -> Self {
        Self::BuildFailed {
            store_id: Uuid::nil(),
            reason: err.to_string(),
        }
    }
}

struct CacheEntry {
    client: Arc<dyn TenantDbClient>,
    built_at: Instant,
    health_epoch: u64,
}

/// A live handle to a tenant's database, plus the epoch it was built
/// under — callers that cache this handle across an await point should
/// re-check [`ConnectionManager::health_epoch`] before relying on stale
/// health assumptions.
#[derive(Clone)]
pub struct TenantHandle {
    pub client: Arc<dyn TenantDbClient>,
    pub health_epoch: u64,
}

/// Caches one [`TenantDbClient`] per `store_id`. Cloneable and cheap to
/// share: internally everything is behind `Arc`.
#[derive(Clone)]
pub struct ConnectionManager {
    pool: sqlx::PgPool,
    vault: Arc<Vault>,
    cache: Arc<RwLock<HashMap<Uuid, CacheEntry>>>,
    build_locks: Arc<RwLock<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl ConnectionManager {
    /// Build an empty manager over the master pool and vault.
    #[must_use]
    pub fn new(pool: sqlx::PgPool, vault: Arc<Vault>) -> Self {
        Self {
            pool,
            vault,
            cache: Arc::new(RwLock::new(HashMap::new())),
            build_locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch a cached client for `store_id`, building and caching one if
    /// absent. Concurrent callers for the same `store_id` coalesce onto a
    /// single build.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NoDatabaseConfigured`] if the store has
    /// no primary database row, or [`ConnectionError::BuildFailed`] if the
    /// connection attempt itself fails.
    pub async fn get(&self, store_id: Uuid) -> Result<TenantHandle, ConnectionError> {
        if let Some(handle) = self.cached(store_id).await {
            return Ok(handle);
        }

        let build_lock = self.build_lock_for(store_id).await;
        let _guard = build_lock.lock().await;

        // Re-check: another task may have finished the build while we
        // waited for the guard.
        if let Some(handle) = self.cached(store_id).await {
            return Ok(handle);
        }

        let handle = self.build(store_id).await?;
        self.cache.write().await.insert(
            store_id,
            CacheEntry {
                client: Arc::clone(&handle.client),
                built_at: Instant::now(),
                health_epoch: handle.health_epoch,
            },
        );
        Ok(handle)
    }

    /// Drop the cached client for `store_id`, forcing the next [`get`] to
    /// rebuild. Called by repair (C5) after credential rotation or schema
    /// changes, and by the health check on a failed probe.
    ///
    /// [`get`]: ConnectionManager::get
    pub async fn invalidate(&self, store_id: Uuid) {
        self.cache.write().await.remove(&store_id);
    }

    /// The epoch of the currently cached client for `store_id`, or `None`
    /// if nothing is cached.
    pub async fn health_epoch(&self, store_id: Uuid) -> Option<u64> {
        self.cache.read().await.get(&store_id).map(|e| e.health_epoch)
    }

    /// How long the cached client for `store_id` has been alive, or
    /// `None` if nothing is cached.
    pub async fn cached_for(&self, store_id: Uuid) -> Option<std::time::Duration> {
        self.cache.read().await.get(&store_id).map(|e| e.built_at.elapsed())
    }

    async fn cached(&self, store_id: Uuid) -> Option<TenantHandle> {
        self.cache.read().await.get(&store_id).map(|entry| TenantHandle {
            client: Arc::clone(&entry.client),
            health_epoch: entry.health_epoch,
        })
    }

    async fn build_lock_for(&self, store_id: Uuid) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.build_locks.read().await.get(&store_id) {
            return Arc::clone(lock);
        }
        let mut locks = self.build_locks.write().await;
        Arc::clone(locks.entry(store_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }

    async fn build(&self, store_id: Uuid) -> Result<TenantHandle, ConnectionError> {
        let decrypted = registry::get_primary_database(&self.pool, &self.vault, store_id)
            .await
            .map_err(|e| match e {
                RegistryError::NoDatabaseConfigured(id) => ConnectionError::NoDatabaseConfigured(id),
                other => ConnectionError::Registry(other),
            })?;

        let client: Arc<dyn TenantDbClient> = match decrypted.database_type {
            DatabaseType::Postgresql | DatabaseType::Supabase => Arc::new(
                PostgresTenantClient::connect(&decrypted.connection_string)
                    .await
                    .map_err(|e| ConnectionError::BuildFailed { store_id, reason: e.to_string() })?,
            ),
            DatabaseType::Mysql => Arc::new(
                MysqlTenantClient::connect(&decrypted.connection_string)
                    .await
                    .map_err(|e| ConnectionError::BuildFailed { store_id, reason: e.to_string() })?,
            ),
        };

        client
            .ping()
            .await
            .map_err(|e| ConnectionError::BuildFailed { store_id, reason: e.to_string() })?;

        let status = if client.ping().await.is_ok() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Failed
        };
        let _ = registry::record_connection_test(&self.pool, store_id, status).await;

        Ok(TenantHandle { client, health_epoch: 0 })
    }

    /// Build a manager backed by the in-memory fake, for tests that don't
    /// need a real tenant database. The cache still behaves identically.
    ///
    /// Populates the cache before the `RwLock` is ever constructed, so the
    /// entry is visible the moment this call returns — no spawned task and
    /// no await-then-race window against the test body.
    #[must_use]
    pub fn with_memory_client_for_tests(pool: sqlx::PgPool, vault: Arc<Vault>, store_id: Uuid) -> Self {
        let mut initial = HashMap::new();
        initial.insert(
            store_id,
            CacheEntry {
                client: Arc::new(MemoryTenantClient::provisioned()) as Arc<dyn TenantDbClient>,
                built_at: Instant::now(),
                health_epoch: 0,
            },
        );
        Self {
            pool,
            vault,
            cache: Arc::new(RwLock::new(initial)),
            build_locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_miss_then_hit_reuses_same_arc() {
        let cache: Arc<RwLock<HashMap<Uuid, CacheEntry>>> = Arc::new(RwLock::new(HashMap::new()));
        let store_id = Uuid::new_v4();
        let client: Arc<dyn TenantDbClient> = Arc::new(MemoryTenantClient::provisioned());

        cache.write().await.insert(
            store_id,
            CacheEntry { client: Arc::clone(&client), built_at: Instant::now(), health_epoch: 3 },
        );

        let fetched = cache.read().await.get(&store_id).map(|e| Arc::clone(&e.client));
        assert!(fetched.is_some());
        assert_eq!(Arc::strong_count(&client), 3);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache: Arc<RwLock<HashMap<Uuid, CacheEntry>>> = Arc::new(RwLock::new(HashMap::new()));
        let store_id = Uuid::new_v4();
        cache.write().await.insert(
            store_id,
            CacheEntry {
                client: Arc::new(MemoryTenantClient::provisioned()),
                built_at: Instant::now(),
                health_epoch: 0,
            },
        );
        cache.write().await.remove(&store_id);
        assert!(cache.read().await.get(&store_id).is_none());
    }
}
