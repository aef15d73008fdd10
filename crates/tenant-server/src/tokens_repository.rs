//! Integration Token Registry (C6) and Token Refresh Scheduler (C7).
//!
//! The repository half follows the same `sqlx::query_as` pattern as
//! [`crate::registry`]; the refresh half follows the singleflight/CAS
//! pattern from `hack-ink-oauth2-broker`'s `flows::refresh` — a per-key
//! async guard coalesces concurrent refresh attempts for the same token,
//! and the eventual write compares against the row observed before the
//! provider call so a concurrent refresh elsewhere doesn't get clobbered.
//!
//! `integration_tokens` carries two columns [`tenant_core::tokens`] has no
//! opinion about (`refresh_token_expires_at`, `last_refresh_error`) — they
//! exist purely for operator visibility and are threaded through at this
//! layer without affecting status derivation.

use std::collections::HashMap;
use std::sync::Arc;

use async_lock::Mutex as AsyncMutex;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use tenant_core::error::VaultError;
use tenant_core::tokens::{
    self, IntegrationToken, StickyStatus, TokenStatus, DEFAULT_EXPIRING_BUFFER,
};
use tenant_core::vault::{CipherBlob, Vault};

/// Errors from the token registry and refresh scheduler.
#[derive(Debug, thiserror::Error)]
pub enum TokenRepositoryError {
    #[error("integration token not found: store {store_id} / {integration_type} / {config_key}")]
    NotFound { store_id: Uuid, integration_type: String, config_key: String },

    #[error("no refresh provider registered for integration type '{0}'")]
    NoProvider(String),

    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The raw `integration_tokens` row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    store_id: Uuid,
    integration_type: String,
    config_key: String,
    access_token_blob: String,
    refresh_token_blob: Option<String>,
    token_expires_at: DateTime<Utc>,
    refresh_token_expires_at: Option<DateTime<Utc>>,
    last_refresh_at: Option<DateTime<Utc>>,
    last_refresh_error: Option<String>,
    sticky_status: Option<String>,
    consecutive_failures: i32,
    max_failures: i32,
}

fn sticky_to_wire(sticky: Option<StickyStatus>) -> Option<&'static str> {
    match sticky {
        Some(StickyStatus::Revoked) => Some("revoked"),
        Some(StickyStatus::RefreshFailed) => Some("refresh_failed"),
        None => None,
    }
}

fn sticky_from_wire(wire: Option<&str>) -> Option<StickyStatus> {
    match wire {
        Some("revoked") => Some(StickyStatus::Revoked),
        Some("refresh_failed") => Some(StickyStatus::RefreshFailed),
        _ => None,
    }
}

impl From<TokenRow> for IntegrationToken {
    fn from(row: TokenRow) -> Self {
        IntegrationToken {
            id: row.id,
            store_id: row.store_id,
            integration_type: row.integration_type,
            config_key: row.config_key,
            access_token_blob: row.access_token_blob,
            refresh_token_blob: row.refresh_token_blob,
            token_expires_at: row.token_expires_at,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            max_failures: row.max_failures.max(0) as u32,
            sticky_status: sticky_from_wire(row.sticky_status.as_deref()),
            last_refreshed_at: row.last_refresh_at,
        }
    }
}

/// Decrypted access/refresh secrets, handed to a [`RefreshProvider`].
/// Callers must never log these.
pub struct DecryptedCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Fresh credentials returned by a successful provider refresh call.
pub struct RefreshedCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome a [`RefreshProvider`] reports for a failed refresh — whether
/// the failure is sticky (the grant itself is gone) or transient (worth
/// retrying on the next scheduler pass).
#[derive(Debug)]
pub enum RefreshFailure {
    /// `invalid_grant` or an explicit revocation — stop retrying.
    InvalidGrantOrRevoked(String),
    /// A transient error (network, rate limit, 5xx) — count against the
    /// failure budget but keep retrying until it's exhausted.
    Transient(String),
}

/// A provider-specific OAuth refresh routine, registered per
/// `integration_type`.
#[async_trait::async_trait]
pub trait RefreshProvider: Send + Sync {
    async fn refresh(&self, credentials: &DecryptedCredentials) -> Result<RefreshedCredentials, RefreshFailure>;
}

/// Maps `integration_type -> RefreshProvider`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<HashMap<String, Arc<dyn RefreshProvider>>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(providers: HashMap<String, Arc<dyn RefreshProvider>>) -> Self {
        Self { providers: Arc::new(providers) }
    }

    #[must_use]
    pub fn get(&self, integration_type: &str) -> Option<Arc<dyn RefreshProvider>> {
        self.providers.get(integration_type).cloned()
    }
}

// ── Repository ───────────────────────────────────────────────────────

/// Encrypt and upsert a token's credentials, keyed by `(store_id,
/// integration_type, config_key)`.
///
/// # Errors
///
/// Returns [`TokenRepositoryError::Vault`] if encryption fails.
pub async fn upsert_token(
    pool: &PgPool,
    vault: &Vault,
    store_id: Uuid,
    integration_type: &str,
    config_key: &str,
    access_token: &str,
    refresh_token: Option<&str>,
    token_expires_at: DateTime<Utc>,
    refresh_token_expires_at: Option<DateTime<Utc>>,
    max_failures: u32,
) -> Result<IntegrationToken, TokenRepositoryError> {
    let access_blob = vault.wrap(access_token.as_bytes())?.to_encoded();
    let refresh_blob = refresh_token
        .map(|t| vault.wrap(t.as_bytes()).map(|b| b.to_encoded()))
        .transpose()?;

    let row = sqlx::query_as::<_, TokenRow>(
        r"INSERT INTO integration_tokens
            (store_id, integration_type, config_key, access_token_blob, refresh_token_blob,
             token_expires_at, refresh_token_expires_at, max_failures, sticky_status, consecutive_failures)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, 0)
          ON CONFLICT (store_id, integration_type, config_key) DO UPDATE SET
            access_token_blob = EXCLUDED.access_token_blob,
            refresh_token_blob = EXCLUDED.refresh_token_blob,
            token_expires_at = EXCLUDED.token_expires_at,
            refresh_token_expires_at = EXCLUDED.refresh_token_expires_at,
            max_failures = EXCLUDED.max_failures,
            sticky_status = NULL,
            consecutive_failures = 0,
            last_refresh_error = NULL,
            updated_at = now()
          RETURNING *",
    )
    .bind(store_id)
    .bind(integration_type)
    .bind(config_key)
    .bind(&access_blob)
    .bind(&refresh_blob)
    .bind(token_expires_at)
    .bind(refresh_token_expires_at)
    .bind(i32::try_from(max_failures).unwrap_or(i32::MAX))
    .fetch_one(pool)
    .await?;

    Ok(row.into())
}

/// Fetch a token by its composite key.
///
/// # Errors
///
/// Returns [`TokenRepositoryError::NotFound`] if no such token exists.
pub async fn get_token(
    pool: &PgPool,
    store_id: Uuid,
    integration_type: &str,
    config_key: &str,
) -> Result<IntegrationToken, TokenRepositoryError> {
    let row = sqlx::query_as::<_, TokenRow>(
        "SELECT * FROM integration_tokens WHERE store_id = $1 AND integration_type = $2 AND config_key = $3",
    )
    .bind(store_id)
    .bind(integration_type)
    .bind(config_key)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| TokenRepositoryError::NotFound {
        store_id,
        integration_type: integration_type.to_owned(),
        config_key: config_key.to_owned(),
    })?;
    Ok(row.into())
}

/// Tokens that are candidates for refresh at `now`: not sticky, within
/// `buffer` of expiring, and under their failure budget. Mirrors
/// [`tenant_core::tokens::is_candidate_for_refresh`] as a SQL predicate so
/// the scheduler doesn't have to load every row to filter client-side.
///
/// # Errors
///
/// Returns [`TokenRepositoryError::Database`] on a query failure.
pub async fn find_expiring(
    pool: &PgPool,
    now: DateTime<Utc>,
    buffer: ChronoDuration,
) -> Result<Vec<IntegrationToken>, TokenRepositoryError> {
    let rows = sqlx::query_as::<_, TokenRow>(
        r"SELECT * FROM integration_tokens
          WHERE sticky_status IS NULL
            AND token_expires_at > $1
            AND token_expires_at <= $2
            AND consecutive_failures < max_failures
          ORDER BY token_expires_at ASC",
    )
    .bind(now)
    .bind(now + buffer)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Decrypt a token's access/refresh secrets for handing to a provider.
///
/// # Errors
///
/// Returns [`TokenRepositoryError::Vault`] if decryption fails.
pub fn decrypt(vault: &Vault, token: &IntegrationToken) -> Result<DecryptedCredentials, TokenRepositoryError> {
    let access_blob = CipherBlob::from_encoded(&token.access_token_blob).map_err(VaultError::from)?;
    let access_token = String::from_utf8_lossy(&vault.unwrap(&access_blob)?).into_owned();

    let refresh_token = token
        .refresh_token_blob
        .as_ref()
        .map(|encoded| -> Result<String, TokenRepositoryError> {
            let blob = CipherBlob::from_encoded(encoded).map_err(VaultError::from)?;
            Ok(String::from_utf8_lossy(&vault.unwrap(&blob)?).into_owned())
        })
        .transpose()?;

    Ok(DecryptedCredentials { access_token, refresh_token })
}

/// Record a successful refresh: re-encrypt and persist the new
/// credentials, clear the failure counter, touch `last_refreshed_at`.
///
/// # Errors
///
/// Returns [`TokenRepositoryError::Vault`] if encryption fails.
pub async fn record_refresh_success(
    pool: &PgPool,
    vault: &Vault,
    token_id: Uuid,
    refreshed: &RefreshedCredentials,
    now: DateTime<Utc>,
) -> Result<(), TokenRepositoryError> {
    let access_blob = vault.wrap(refreshed.access_token.as_bytes())?.to_encoded();
    let refresh_blob = refreshed
        .refresh_token
        .as_ref()
        .map(|t| vault.wrap(t.as_bytes()).map(|b| b.to_encoded()))
        .transpose()?;

    sqlx::query(
        r"UPDATE integration_tokens SET
            access_token_blob = $2,
            refresh_token_blob = COALESCE($3, refresh_token_blob),
            token_expires_at = $4,
            consecutive_failures = 0,
            last_refresh_at = $5,
            last_refresh_error = NULL,
            updated_at = now()
          WHERE id = $1",
    )
    .bind(token_id)
    .bind(&access_blob)
    .bind(&refresh_blob)
    .bind(refreshed.expires_at)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a failed refresh. Transient failures increment the counter and
/// set `refresh_failed` sticky status once the budget is exhausted (per
/// [`tenant_core::tokens::record_refresh_failure`]); `invalid_grant`/
/// revocation failures set `revoked` sticky status immediately.
///
/// # Errors
///
/// Returns [`TokenRepositoryError::Database`] on a query failure.
pub async fn record_refresh_failure(
    pool: &PgPool,
    token_id: Uuid,
    failure: &RefreshFailure,
    current_failures: u32,
    max_failures: u32,
) -> Result<(), TokenRepositoryError> {
    let (sticky, reason) = match failure {
        RefreshFailure::InvalidGrantOrRevoked(reason) => (Some("revoked"), reason.clone()),
        RefreshFailure::Transient(reason) => {
            let next_failures = current_failures.saturating_add(1);
            let sticky = if next_failures >= max_failures { Some("refresh_failed") } else { None };
            (sticky, reason.clone())
        }
    };

    sqlx::query(
        r"UPDATE integration_tokens SET
            consecutive_failures = CASE WHEN sticky_status IS NULL THEN consecutive_failures + 1 ELSE consecutive_failures END,
            sticky_status = COALESCE(sticky_status, $2),
            last_refresh_error = $3,
            updated_at = now()
          WHERE id = $1",
    )
    .bind(token_id)
    .bind(sticky)
    .bind(&reason)
    .execute(pool)
    .await?;
    Ok(())
}

// ── Scheduler (C7) ──────────────────────────────────────────────────

/// Coalesces concurrent refresh attempts for the same token behind a
/// per-id async mutex, following the singleflight guard the OAuth broker
/// uses around its own `compare_and_swap_refresh` call.
#[derive(Clone, Default)]
pub struct RefreshGuards {
    locks: Arc<RwLock<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl RefreshGuards {
    async fn for_token(&self, token_id: Uuid) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&token_id) {
            return Arc::clone(lock);
        }
        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(token_id).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }
}

/// Attempt to refresh a single token: acquire its singleflight guard,
/// re-fetch the current row (a concurrent pass may have already refreshed
/// it), decrypt, call the registered provider, and record the outcome.
///
/// Returns `Ok(true)` if a refresh was actually performed, `Ok(false)` if
/// the token was found to no longer need refreshing once the guard was
/// acquired (already refreshed by a concurrent caller).
///
/// # Errors
///
/// Returns [`TokenRepositoryError::NoProvider`] if no provider is
/// registered for the token's `integration_type`.
pub async fn refresh_one(
    pool: &PgPool,
    vault: &Vault,
    providers: &ProviderRegistry,
    guards: &RefreshGuards,
    token_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, TokenRepositoryError> {
    let guard = guards.for_token(token_id).await;
    let _singleflight = guard.lock().await;

    let current = fetch_by_id(pool, token_id).await?;
    if !tokens::is_candidate_for_refresh(&current, now, DEFAULT_EXPIRING_BUFFER) {
        return Ok(false);
    }

    let provider = providers
        .get(&current.integration_type)
        .ok_or_else(|| TokenRepositoryError::NoProvider(current.integration_type.clone()))?;

    let credentials = decrypt(vault, &current)?;

    match provider.refresh(&credentials).await {
        Ok(refreshed) => {
            record_refresh_success(pool, vault, current.id, &refreshed, now).await?;
            tracing::info!(token_id = %current.id, integration_type = %current.integration_type, "refreshed integration token");
        }
        Err(failure) => {
            record_refresh_failure(pool, current.id, &failure, current.consecutive_failures, current.max_failures).await?;
            tracing::warn!(token_id = %current.id, integration_type = %current.integration_type, ?failure, "integration token refresh failed");
        }
    }

    Ok(true)
}

async fn fetch_by_id(pool: &PgPool, token_id: Uuid) -> Result<IntegrationToken, TokenRepositoryError> {
    let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM integration_tokens WHERE id = $1")
        .bind(token_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| TokenRepositoryError::NotFound {
            store_id: Uuid::nil(),
            integration_type: String::new(),
            config_key: String::new(),
        })?;
    Ok(row.into())
}

/// Run one scheduler pass: find every token expiring within `buffer` and
/// attempt to refresh each. Individual failures don't abort the pass —
/// each token's outcome is recorded independently.
///
/// Returns the number of tokens for which a refresh attempt actually ran.
///
/// # Errors
///
/// Returns [`TokenRepositoryError::Database`] if the initial scan query
/// fails.
pub async fn run_scheduler_pass(
    pool: &PgPool,
    vault: &Vault,
    providers: &ProviderRegistry,
    guards: &RefreshGuards,
    buffer: ChronoDuration,
) -> Result<usize, TokenRepositoryError> {
    let now = Utc::now();
    let candidates = find_expiring(pool, now, buffer).await?;
    let mut attempted = 0;

    for token in candidates {
        match refresh_one(pool, vault, providers, guards, token.id, now).await {
            Ok(true) => attempted += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(token_id = %token.id, error = %e, "token refresh attempt errored"),
        }
    }

    Ok(attempted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sticky_status_roundtrips_through_wire() {
        assert_eq!(sticky_from_wire(sticky_to_wire(Some(StickyStatus::Revoked))), Some(StickyStatus::Revoked));
        assert_eq!(sticky_from_wire(sticky_to_wire(Some(StickyStatus::RefreshFailed))), Some(StickyStatus::RefreshFailed));
        assert_eq!(sticky_from_wire(sticky_to_wire(None)), None);
    }

    #[tokio::test]
    async fn refresh_guards_issue_same_lock_for_same_token() {
        let guards = RefreshGuards::default();
        let token_id = Uuid::new_v4();
        let a = guards.for_token(token_id).await;
        let b = guards.for_token(token_id).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    fn sample_token(sticky: Option<StickyStatus>, failures: u32, max: u32) -> IntegrationToken {
        IntegrationToken {
            id: Uuid::new_v4(),
            store_id: Uuid::new_v4(),
            integration_type: "shopify".to_owned(),
            config_key: "default".to_owned(),
            access_token_blob: "blob".to_owned(),
            refresh_token_blob: None,
            token_expires_at: Utc::now() + ChronoDuration::minutes(1),
            consecutive_failures: failures,
            max_failures: max,
            sticky_status: sticky,
            last_refreshed_at: None,
        }
    }

    #[test]
    fn is_candidate_excludes_exhausted_and_sticky_tokens() {
        assert!(!tokens::is_candidate_for_refresh(
            &sample_token(Some(StickyStatus::Revoked), 0, 5),
            Utc::now(),
            DEFAULT_EXPIRING_BUFFER
        ));
        assert!(!tokens::is_candidate_for_refresh(
            &sample_token(None, 5, 5),
            Utc::now(),
            DEFAULT_EXPIRING_BUFFER
        ));
        assert!(tokens::is_candidate_for_refresh(
            &sample_token(None, 0, 5),
            Utc::now(),
            DEFAULT_EXPIRING_BUFFER
        ));
    }

    #[test]
    fn token_status_matches_core_derivation() {
        let active = sample_token(None, 0, 5);
        assert_eq!(tokens::derive_status(&active, Utc::now(), DEFAULT_EXPIRING_BUFFER), TokenStatus::Expiring);
    }
}
