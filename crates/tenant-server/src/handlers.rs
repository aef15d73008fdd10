//! Built-in [`crate::jobs::JobHandler`] implementations.
//!
//! These are the job types the cron scheduler's default entries enqueue.
//! Collaborators register additional handlers (e.g. `send_email`,
//! `export_report`) alongside these when building the [`crate::jobs::HandlerRegistry`].

use chrono::Duration as ChronoDuration;
use sqlx::PgPool;
use tenant_core::jobs::Job;
use tenant_core::vault::Vault;

use crate::jobs::JobHandler;
use crate::tokens_repository::{ProviderRegistry, RefreshGuards};

/// Runs one Token Refresh Scheduler (C7) pass per invocation. Registered
/// under the `refresh_tokens` job type, fired periodically by a
/// `cron_jobs` entry.
pub struct RefreshTokensHandler {
    pool: PgPool,
    vault: std::sync::Arc<Vault>,
    providers: ProviderRegistry,
    guards: RefreshGuards,
    buffer: ChronoDuration,
}

impl RefreshTokensHandler {
    #[must_use]
    pub fn new(
        pool: PgPool,
        vault: std::sync::Arc<Vault>,
        providers: ProviderRegistry,
        guards: RefreshGuards,
        buffer: ChronoDuration,
    ) -> Self {
        Self { pool, vault, providers, guards, buffer }
    }
}

#[async_trait::async_trait]
impl JobHandler for RefreshTokensHandler {
    async fn run(&self, _job: &Job) -> Result<serde_json::Value, String> {
        let attempted =
            crate::tokens_repository::run_scheduler_pass(&self.pool, &self.vault, &self.providers, &self.guards, self.buffer)
                .await
                .map_err(|e| e.to_string())?;
        Ok(serde_json::json!({ "attempted": attempted }))
    }
}
