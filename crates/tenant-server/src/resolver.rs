//! Tenant Resolver (C3) — maps an inbound request to a store id without
//! ever touching a tenant database. Resolution order per request:
//!
//! 1. An explicit `X-Store-Id` header (trusted internal callers, e.g. the
//!    job worker acting on behalf of a store).
//! 2. A `store_id` query parameter.
//! 3. The request's `Host` header, matched against `store_hostnames`.
//! 4. A path-prefixed slug (`/s/{slug}/...`), matched against `stores`.
//!
//! Every candidate that resolves to a store also re-checks
//! [`Store::serves_storefront`] unless `allow_inactive` is set — callers
//! acting as operators (the CLI, admin routes) pass `allow_inactive: true`
//! to resolve suspended or pending stores too.

use axum::http::HeaderMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::registry::{self, RegistryError, Store, StoreStatus};

const STORE_ID_HEADER: &str = "x-store-id";

/// Failures specific to resolution, mapped onto [`crate::error::ServerError`]
/// at the route boundary.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("no store matches hostname '{hostname}'")]
    NoMatchingHostname { hostname: String },

    #[error("no store matches slug '{slug}'")]
    NoMatchingSlug { slug: String },

    #[error("store {store_id} is not currently serving storefront traffic")]
    StoreInactive { store_id: Uuid },

    #[error("request carries no hostname, header, query, or slug to resolve against")]
    Ambiguous,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// The raw signals a resolution pass reads from an inbound request. Built
/// by the route layer from headers/query/path so this module stays free
/// of any particular web framework request type beyond `HeaderMap`.
#[derive(Debug, Default, Clone)]
pub struct ResolutionInput {
    pub header_store_id: Option<Uuid>,
    pub query_store_id: Option<Uuid>,
    pub host: Option<String>,
    pub path_slug: Option<String>,
}

impl ResolutionInput {
    /// Build an input from headers plus the route-extracted query/path
    /// values. `host` is taken from the `Host` header if present.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, query_store_id: Option<Uuid>, path_slug: Option<String>) -> Self {
        let header_store_id = headers
            .get(STORE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok());
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(':').next().unwrap_or(v).to_owned());
        Self { header_store_id, query_store_id, host, path_slug }
    }
}

/// Resolve a store for a storefront-facing request: only stores that
/// currently [`Store::serves_storefront`] are returned.
///
/// # Errors
///
/// Returns [`ResolverError::Ambiguous`] if none of the four signals are
/// present, `NoMatchingHostname`/`NoMatchingSlug` if a signal is present
/// but doesn't resolve, or `StoreInactive` if the resolved store exists
/// but isn't serving storefront traffic.
pub async fn resolve_storefront(pool: &PgPool, input: &ResolutionInput) -> Result<Store, ResolverError> {
    let store = resolve(pool, input).await?;
    if store.serves_storefront() {
        Ok(store)
    } else {
        Err(ResolverError::StoreInactive { store_id: store.id })
    }
}

/// Resolve a store for an operator-facing request (CLI, admin API):
/// returns the store regardless of lifecycle status as long as one of the
/// four signals resolves to a real row.
///
/// # Errors
///
/// Same as [`resolve_storefront`], minus the `StoreInactive` check.
pub async fn resolve_any(pool: &PgPool, input: &ResolutionInput) -> Result<Store, ResolverError> {
    resolve(pool, input).await
}

async fn resolve(pool: &PgPool, input: &ResolutionInput) -> Result<Store, ResolverError> {
    if let Some(id) = input.header_store_id {
        return Ok(registry::get_store(pool, id).await?);
    }
    if let Some(id) = input.query_store_id {
        return Ok(registry::get_store(pool, id).await?);
    }
    if let Some(host) = &input.host {
        let hostname_row = registry::find_store_by_hostname(pool, host)
            .await?
            .ok_or_else(|| ResolverError::NoMatchingHostname { hostname: host.clone() })?;
        return Ok(registry::get_store(pool, hostname_row.store_id).await?);
    }
    if let Some(slug) = &input.path_slug {
        return get_store_by_slug(pool, slug).await;
    }
    Err(ResolverError::Ambiguous)
}

async fn get_store_by_slug(pool: &PgPool, slug: &str) -> Result<Store, ResolverError> {
    sqlx::query_as::<_, Store>("SELECT * FROM stores WHERE slug = $1")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .map_err(RegistryError::from)?
        .ok_or_else(|| ResolverError::NoMatchingSlug { slug: slug.to_owned() })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_store(status: StoreStatus, published: bool) -> Store {
        Store {
            id: Uuid::new_v4(),
            slug: "shop".to_owned(),
            user_id: Uuid::new_v4(),
            status,
            is_active: matches!(status, StoreStatus::Active),
            published,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn resolution_input_prefers_header_over_host() {
        let mut headers = HeaderMap::new();
        let id = Uuid::new_v4();
        headers.insert(STORE_ID_HEADER, id.to_string().parse().unwrap());
        headers.insert(axum::http::header::HOST, "shop.example:443".parse().unwrap());
        let input = ResolutionInput::from_headers(&headers, None, None);
        assert_eq!(input.header_store_id, Some(id));
        assert_eq!(input.host.as_deref(), Some("shop.example"));
    }

    #[test]
    fn active_published_store_serves_storefront() {
        assert!(sample_store(StoreStatus::Active, true).serves_storefront());
        assert!(!sample_store(StoreStatus::Active, false).serves_storefront());
        assert!(!sample_store(StoreStatus::Demo, true).serves_storefront());
    }
}
