//! Tenant Runtime Core server entry point.
//!
//! Bootstraps the master database pool and credential vault, then starts
//! the Axum HTTP server alongside two background workers: the job lease
//! loop and the leader-elected cron ticker. The token refresh scheduler
//! itself runs as a `refresh_tokens` job handler, fired by a `cron_jobs`
//! entry rather than as a third standalone loop. All workers are cancelled
//! on graceful shutdown.
//!
//! All of the bootstrap logic lives in [`tenant_server::bootstrap`] so
//! `tenant-cli` can embed it (e.g. to run just the job worker or just the
//! cron ticker as a separate process) without shelling out to this binary.

use tenant_server::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    tenant_server::bootstrap::run(config).await
}
