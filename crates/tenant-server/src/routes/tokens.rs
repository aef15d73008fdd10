//! Integration Token Registry (C6) administration and a manual trigger for
//! the Token Refresh Scheduler (C7) pass.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tenant_core::tokens::{derive_status, IntegrationToken, TokenStatus, DEFAULT_EXPIRING_BUFFER};

use crate::error::ServerError;
use crate::state::AppState;

/// Build the integration token router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stores/{store_id}/tokens", post(upsert))
        .route("/stores/{store_id}/tokens/{integration_type}/{config_key}", get(get_one))
        .route("/tokens/refresh-pass", post(trigger_refresh_pass))
}

#[derive(Debug, Deserialize)]
pub struct UpsertTokenRequest {
    integration_type: String,
    config_key: String,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    token_expires_at: DateTime<Utc>,
    #[serde(default)]
    refresh_token_expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_failures")]
    max_failures: u32,
}

fn default_max_failures() -> u32 {
    5
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    id: Uuid,
    store_id: Uuid,
    integration_type: String,
    config_key: String,
    token_expires_at: DateTime<Utc>,
    status: &'static str,
}

fn status_to_wire(status: TokenStatus) -> &'static str {
    match status {
        TokenStatus::Active => "active",
        TokenStatus::Expiring => "expiring",
        TokenStatus::Expired => "expired",
        TokenStatus::Revoked => "revoked",
        TokenStatus::RefreshFailed => "refresh_failed",
    }
}

impl TokenResponse {
    fn from_token(token: &IntegrationToken, now: DateTime<Utc>) -> Self {
        Self {
            id: token.id,
            store_id: token.store_id,
            integration_type: token.integration_type.clone(),
            config_key: token.config_key.clone(),
            token_expires_at: token.token_expires_at,
            status: status_to_wire(derive_status(token, now, DEFAULT_EXPIRING_BUFFER)),
        }
    }
}

/// `POST /v1/stores/{store_id}/tokens` — store (or rotate) an integration's
/// OAuth credentials. Clears any sticky `revoked`/`refresh_failed` status
/// and resets the failure counter, since a fresh credential set deserves a
/// clean slate.
async fn upsert(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
    Json(body): Json<UpsertTokenRequest>,
) -> Result<Json<TokenResponse>, ServerError> {
    let token = crate::tokens_repository::upsert_token(
        &state.pool,
        &state.vault,
        store_id,
        &body.integration_type,
        &body.config_key,
        &body.access_token,
        body.refresh_token.as_deref(),
        body.token_expires_at,
        body.refresh_token_expires_at,
        body.max_failures,
    )
    .await?;
    Ok(Json(TokenResponse::from_token(&token, Utc::now())))
}

/// `GET /v1/stores/{store_id}/tokens/{integration_type}/{config_key}` —
/// fetch a token's status without exposing the underlying secret.
async fn get_one(
    State(state): State<AppState>,
    Path((store_id, integration_type, config_key)): Path<(Uuid, String, String)>,
) -> Result<Json<TokenResponse>, ServerError> {
    let token = crate::tokens_repository::get_token(&state.pool, store_id, &integration_type, &config_key).await?;
    Ok(Json(TokenResponse::from_token(&token, Utc::now())))
}

#[derive(Debug, Deserialize)]
pub struct RefreshPassQuery {
    #[serde(default)]
    buffer_mins: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RefreshPassResponse {
    attempted: usize,
}

/// `POST /v1/tokens/refresh-pass` — run one Token Refresh Scheduler pass
/// immediately, outside the background interval. Mainly for operator use
/// after registering a new provider or investigating a stuck token.
async fn trigger_refresh_pass(
    State(state): State<AppState>,
    Query(query): Query<RefreshPassQuery>,
) -> Result<Json<RefreshPassResponse>, ServerError> {
    let buffer = query.buffer_mins.map(ChronoDuration::minutes).unwrap_or(DEFAULT_EXPIRING_BUFFER);
    let attempted = crate::tokens_repository::run_scheduler_pass(
        &state.pool,
        &state.vault,
        &state.refresh_providers,
        &state.refresh_guards,
        buffer,
    )
    .await?;
    Ok(Json(RefreshPassResponse { attempted }))
}
