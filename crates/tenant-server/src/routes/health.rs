//! Tenant database health probing.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ServerError;
use crate::health_repair::HealthStatus;
use crate::state::AppState;

/// Build the health-probe router.
pub fn router() -> Router<AppState> {
    Router::new().route("/stores/{store_id}/health", get(health))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HealthResponse {
    Healthy,
    Empty { tables_present: usize },
    Unreachable,
}

impl From<HealthStatus> for HealthResponse {
    fn from(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => Self::Healthy,
            HealthStatus::Empty { tables_present } => Self::Empty { tables_present },
            HealthStatus::Unreachable => Self::Unreachable,
        }
    }
}

/// `GET /v1/stores/{store_id}/health` — probe a store's tenant database
/// and report whether it's healthy, freshly provisioned, or unreachable.
async fn health(
    State(state): State<AppState>,
    Path(store_id): Path<Uuid>,
) -> Result<Json<HealthResponse>, ServerError> {
    let status = crate::health_repair::probe(&state.connections, store_id).await?;
    Ok(Json(status.into()))
}
