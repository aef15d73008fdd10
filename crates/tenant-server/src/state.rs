//! Shared application state for the Tenant Runtime Core server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers and background workers via `Clone` (every field is
//! already cheap to clone: a pool, `Arc`s, or registries that are
//! themselves `Arc`-backed internally).

use std::sync::Arc;

use sqlx::PgPool;

use tenant_core::vault::Vault;

use crate::config::ServerConfig;
use crate::connection_manager::ConnectionManager;
use crate::jobs::HandlerRegistry;
use crate::tokens_repository::{ProviderRegistry, RefreshGuards};

/// Shared application state passed to all HTTP handlers and background
/// workers.
#[derive(Clone)]
pub struct AppState {
    /// Master DB connection pool.
    pub pool: PgPool,
    /// The Credential Vault (C1) used to wrap/unwrap database credentials
    /// and integration token secrets.
    pub vault: Arc<Vault>,
    /// Connection Manager (C4) — cached tenant database clients.
    pub connections: ConnectionManager,
    /// Job Engine (C8) handler registry.
    pub job_handlers: HandlerRegistry,
    /// Token Refresh Scheduler (C7) provider registry.
    pub refresh_providers: ProviderRegistry,
    /// Per-token singleflight guards for the refresh scheduler.
    pub refresh_guards: RefreshGuards,
    /// The config this state was built from, kept around for background
    /// workers spawned after the router itself no longer needs it.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Assemble application state over an already-connected master pool
    /// and vault, with empty job-handler/refresh-provider registries.
    /// Callers register their own handlers/providers with
    /// [`AppState::with_job_handlers`]/[`AppState::with_refresh_providers`]
    /// before serving.
    #[must_use]
    pub fn new(pool: PgPool, vault: Arc<Vault>, config: Arc<ServerConfig>) -> Self {
        let connections = ConnectionManager::new(pool.clone(), Arc::clone(&vault));
        Self {
            pool,
            vault,
            connections,
            job_handlers: HandlerRegistry::default(),
            refresh_providers: ProviderRegistry::default(),
            refresh_guards: RefreshGuards::default(),
            config,
        }
    }

    /// Replace the job handler registry.
    #[must_use]
    pub fn with_job_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.job_handlers = handlers;
        self
    }

    /// Replace the refresh provider registry.
    #[must_use]
    pub fn with_refresh_providers(mut self, providers: ProviderRegistry) -> Self {
        self.refresh_providers = providers;
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
