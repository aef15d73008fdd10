//! HTTP route handlers, realizing spec.md's external interface table.
//!
//! All routes are nested under `/v1/` and share one `AppState` (the master
//! pool, vault, connection manager, and the job/refresh registries). There
//! is no authentication middleware here — the Tenant Runtime Core is an
//! internal service; the collaborator embedding it (the admin API, the
//! storefront edge) is expected to authenticate the caller before this
//! layer is reached, the same boundary the teacher draws between its
//! public-facing auth middleware and its internal engine calls.

pub mod health;
pub mod jobs;
pub mod stores;
pub mod tokens;

use axum::Router;

use crate::state::AppState;

/// Build the complete `/v1/` router over shared application state.
#[must_use]
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(stores::router())
        .merge(health::router())
        .merge(jobs::router())
        .merge(tokens::router());

    Router::new().nest("/v1", api).with_state(state)
}
