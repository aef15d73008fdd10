//! Store, database, and hostname administration, plus tenant resolution.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::{self, DatabaseType, Store};
use crate::error::ServerError;
use crate::resolver::ResolutionInput;
use crate::state::AppState;

/// Build the stores/resolution router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/resolve", get(resolve))
        .route("/stores", post(create_store))
        .route("/stores/{store_id}", get(get_store))
        .route("/stores/{store_id}/database", post(attach_database))
        .route("/stores/{store_id}/hostnames", post(upsert_hostname))
        .route("/stores/{store_id}/reprovision", post(reprovision))
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    store_id: Option<Uuid>,
    slug: Option<String>,
}

/// `GET /v1/resolve` — resolve a request to a store. Tries, in order, the
/// `X-Store-Id` header, the `store_id` query parameter, the `Host` header,
/// then the `slug` query parameter. Only stores currently serving
/// storefront traffic are returned.
async fn resolve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<Store>, ServerError> {
    let input = ResolutionInput::from_headers(&headers, query.store_id, query.slug);
    let store = crate::resolver::resolve_storefront(&state.pool, &input).await?;
    Ok(Json(store))
}

#[derive(Debug, Deserialize)]
pub struct CreateStoreRequest {
    owner_id: Uuid,
    slug: String,
}

/// `POST /v1/stores` — create a store in `pending_database`.
async fn create_store(
    State(state): State<AppState>,
    Json(body): Json<CreateStoreRequest>,
) -> Result<Json<Store>, ServerError> {
    let store = registry::create_store(&state.pool, body.owner_id, &body.slug).await?;
    Ok(Json(store))
}

/// `GET /v1/stores/{store_id}` — fetch a store by id.
async fn get_store(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
) -> Result<Json<Store>, ServerError> {
    let store = registry::get_store(&state.pool, store_id).await?;
    Ok(Json(store))
}

#[derive(Debug, Deserialize)]
pub struct AttachDatabaseRequest {
    database_type: DatabaseType,
    connection_string: String,
    host: Option<String>,
    port: Option<i32>,
    database_name: Option<String>,
}

/// `POST /v1/stores/{store_id}/database` — attach (or replace) a store's
/// primary database.
async fn attach_database(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
    Json(body): Json<AttachDatabaseRequest>,
) -> Result<Json<registry::StoreDatabase>, ServerError> {
    let db = registry::attach_database(
        &state.pool,
        &state.vault,
        store_id,
        body.database_type,
        &body.connection_string,
        body.host.as_deref(),
        body.port,
        body.database_name.as_deref(),
    )
    .await?;
    Ok(Json(db))
}

#[derive(Debug, Deserialize)]
pub struct UpsertHostnameRequest {
    hostname: String,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    is_primary: bool,
    #[serde(default)]
    is_custom_domain: bool,
}

/// `POST /v1/stores/{store_id}/hostnames` — bind a hostname to a store.
/// `slug` defaults to the routing slug derived from the hostname itself.
async fn upsert_hostname(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
    Json(body): Json<UpsertHostnameRequest>,
) -> Result<Json<registry::StoreHostname>, ServerError> {
    let slug = body.slug.unwrap_or_else(|| registry::slug_from_hostname(&body.hostname));
    let row = registry::upsert_hostname(
        &state.pool,
        store_id,
        &body.hostname,
        &slug,
        body.is_primary,
        body.is_custom_domain,
    )
    .await?;
    Ok(Json(row))
}

#[derive(Debug, Deserialize)]
pub struct ReprovisionRequest {
    owner_email: String,
}

#[derive(Debug, Serialize)]
pub struct ReprovisionResponse {
    store_id: Uuid,
    status: &'static str,
}

/// `POST /v1/stores/{store_id}/reprovision` — re-run migrations and seed
/// data against the store's tenant database, then mark it active.
async fn reprovision(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
    Json(body): Json<ReprovisionRequest>,
) -> Result<Json<ReprovisionResponse>, ServerError> {
    crate::health_repair::repair(&state.pool, &state.connections, store_id, &body.owner_email).await?;
    Ok(Json(ReprovisionResponse { store_id, status: "active" }))
}
