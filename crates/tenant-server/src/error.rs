//! HTTP error types for the Tenant Runtime Core server.
//!
//! Maps domain errors from `tenant-core` and this crate's own repository/
//! resolver/connection-manager errors into HTTP responses. Every variant
//! produces a JSON body with a machine-readable `error` field and a
//! human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use tenant_core::error::{CronError, JobError, TokenRegistryError, VaultError};

/// Application-level error returned from HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Authentication failed or token invalid.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Policy or tier denied the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Requested resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Client sent invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A conflict (duplicate hostname, dedupe key already live, etc.).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The tenant's database could not be reached.
    #[error("tenant database unreachable: {0}")]
    TenantUnreachable(String),

    /// Internal server error (database, crypto, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::TenantUnreachable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "tenant_unreachable", msg),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_owned(),
                )
            }
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("resource not found".to_owned()),
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    Self::Conflict("resource already exists".to_owned())
                } else {
                    Self::Internal(format!("database error: {db_err}"))
                }
            }
            _ => Self::Internal(format!("database error: {err}")),
        }
    }
}

impl From<tenant_storage::StorageError> for ServerError {
    fn from(err: tenant_storage::StorageError) -> Self {
        Self::TenantUnreachable(err.to_string())
    }
}

impl From<VaultError> for ServerError {
    fn from(err: VaultError) -> Self {
        Self::Internal(format!("vault error: {err}"))
    }
}

impl From<JobError> for ServerError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::IllegalTransition { .. } => Self::Conflict(err.to_string()),
            JobError::RetriesExhausted { .. } => Self::Conflict(err.to_string()),
            JobError::InvalidDefinition { .. } => Self::BadRequest(err.to_string()),
        }
    }
}

impl From<CronError> for ServerError {
    fn from(err: CronError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<TokenRegistryError> for ServerError {
    fn from(err: TokenRegistryError) -> Self {
        match err {
            TokenRegistryError::NotFound { .. } => Self::NotFound(err.to_string()),
            TokenRegistryError::Blocked { .. } => Self::Conflict(err.to_string()),
            TokenRegistryError::NoProvider { .. } => Self::BadRequest(err.to_string()),
            TokenRegistryError::Vault(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<crate::registry::RegistryError> for ServerError {
    fn from(err: crate::registry::RegistryError) -> Self {
        use crate::registry::RegistryError as E;
        match err {
            E::StoreNotFound(_) => Self::NotFound(err.to_string()),
            E::NoDatabaseConfigured(_) => Self::Conflict(err.to_string()),
            E::SlugConflict(_) | E::HostnameConflict(_) => Self::Conflict(err.to_string()),
            E::InvalidSlug(_) => Self::BadRequest(err.to_string()),
            E::Vault(_) | E::Database(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<crate::resolver::ResolverError> for ServerError {
    fn from(err: crate::resolver::ResolverError) -> Self {
        use crate::resolver::ResolverError as E;
        match err {
            E::NoMatchingHostname { .. } | E::NoMatchingSlug { .. } => Self::NotFound(err.to_string()),
            E::StoreInactive { .. } => Self::Forbidden(err.to_string()),
            E::Ambiguous => Self::BadRequest(err.to_string()),
            E::Registry(inner) => inner.into(),
        }
    }
}

impl From<crate::connection_manager::ConnectionError> for ServerError {
    fn from(err: crate::connection_manager::ConnectionError) -> Self {
        use crate::connection_manager::ConnectionError as E;
        match err {
            E::NoDatabaseConfigured(_) => Self::Conflict(err.to_string()),
            E::BuildFailed { .. } => Self::TenantUnreachable(err.to_string()),
            E::Registry(inner) => inner.into(),
        }
    }
}

impl From<crate::tokens_repository::TokenRepositoryError> for ServerError {
    fn from(err: crate::tokens_repository::TokenRepositoryError) -> Self {
        use crate::tokens_repository::TokenRepositoryError as E;
        match err {
            E::NotFound { .. } => Self::NotFound(err.to_string()),
            E::NoProvider(_) => Self::BadRequest(err.to_string()),
            E::Vault(_) | E::Database(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<crate::health_repair::RepairError> for ServerError {
    fn from(err: crate::health_repair::RepairError) -> Self {
        use crate::health_repair::RepairError as E;
        match err {
            E::NotFound(_) => Self::NotFound(err.to_string()),
            E::Storage(_) | E::Connection(_) | E::Registry(_) => Self::TenantUnreachable(err.to_string()),
            E::RepairFailed { .. } => Self::Internal(err.to_string()),
        }
    }
}
