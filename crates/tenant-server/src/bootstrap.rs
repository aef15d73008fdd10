//! Process bootstrap: wiring config into a runnable server + background
//! workers, and running them to completion.
//!
//! Split out of `main.rs` so the same bootstrap can be driven either by
//! the `tenant-server` binary directly or by `tenant-cli serve`, which
//! embeds this crate rather than shelling out to it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Duration as ChronoDuration;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use tenant_core::crypto::EncryptionKey;
use tenant_core::vault::Vault;

use crate::config::ServerConfig;
use crate::handlers::RefreshTokensHandler;
use crate::hardening;
use crate::jobs::{HandlerRegistry, JobHandler};
use crate::state::AppState;
use crate::tokens_repository::ProviderRegistry;
use crate::{cron_scheduler, jobs, routes, tokens_repository};

/// Initialize tracing, build application state, serve `/v1/*`, and run the
/// job worker + cron ticker loops until a shutdown signal arrives. Returns
/// once every background worker has stopped (or timed out stopping).
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    apply_hardening(&config);

    info!(addr = %config.bind_addr, "tenant runtime core starting");

    let state = build_app_state(&config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let job_worker_handle = {
        let pool = state.pool.clone();
        let registry = state.job_handlers.clone();
        let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
        let limit = config.job_worker_lease_limit;
        let interval_secs = config.job_worker_poll_interval_secs;
        let visibility = ChronoDuration::seconds(config.job_lease_visibility_secs);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move { job_worker_loop(&pool, &registry, &worker_id, limit, interval_secs, visibility, &mut rx).await })
    };

    let cron_worker_handle = {
        let pool = state.pool.clone();
        let interval_secs = config.cron_tick_interval_secs;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move { cron_worker_loop(&pool, interval_secs, &mut rx).await })
    };

    let app = routes::router(state.clone());

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "tenant runtime core listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    let _ = tokio::time::timeout(Duration::from_secs(10), job_worker_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), cron_worker_handle).await;

    info!("tenant runtime core stopped");
    Ok(())
}

/// Run only the job lease/execute loop (no HTTP listener, no cron ticker).
/// Intended for a horizontally-scaled worker fleet running apart from the
/// API process, per `spec.md` §5's "job workers are horizontally scalable".
pub async fn run_job_worker(config: ServerConfig) -> anyhow::Result<()> {
    info!("tenant runtime job worker starting");
    let state = build_app_state(&config).await?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(shutdown_tx));

    let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
    job_worker_loop(
        &state.pool,
        &state.job_handlers,
        &worker_id,
        config.job_worker_lease_limit,
        config.job_worker_poll_interval_secs,
        ChronoDuration::seconds(config.job_lease_visibility_secs),
        &mut shutdown_rx,
    )
    .await;
    Ok(())
}

/// Run only the leader-elected cron ticker (no HTTP listener, no job
/// worker). Exactly one instance cluster-wide holds leadership at a time;
/// see `cron_scheduler::try_acquire_leadership`.
pub async fn run_cron_ticker(config: ServerConfig) -> anyhow::Result<()> {
    info!("tenant runtime cron ticker starting");
    let state = build_app_state(&config).await?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(shutdown_signal(shutdown_tx));

    cron_worker_loop(&state.pool, config.cron_tick_interval_secs, &mut shutdown_rx).await;
    Ok(())
}

/// Assemble application state: connect the master pool, build the vault
/// from its configured key, and register the built-in job handlers.
pub async fn build_app_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("failed to connect to master database")?;

    let vault = Arc::new(build_vault(config)?);

    let refresh_providers = ProviderRegistry::default();
    let refresh_guards = tokens_repository::RefreshGuards::default();

    let refresh_handler: Arc<dyn JobHandler> = Arc::new(RefreshTokensHandler::new(
        pool.clone(),
        Arc::clone(&vault),
        refresh_providers.clone(),
        refresh_guards.clone(),
        ChronoDuration::minutes(config.token_refresh_buffer_mins),
    ));
    let mut handlers = std::collections::HashMap::new();
    handlers.insert("refresh_tokens".to_owned(), refresh_handler);
    let job_handlers = HandlerRegistry::new(handlers);

    let state = AppState::new(pool, vault, Arc::new(config.clone()))
        .with_job_handlers(job_handlers)
        .with_refresh_providers(refresh_providers);

    Ok(state)
}

/// Build the Credential Vault from `VAULT_MASTER_KEY_BASE64`. The decoded
/// key becomes key version 1; operators rotate in new versions via
/// [`tenant_core::vault::Vault::rotate_in`] through a maintenance job, not
/// by restarting with a different env var.
pub fn build_vault(config: &ServerConfig) -> anyhow::Result<Vault> {
    use base64::Engine as _;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&config.vault_master_key_base64)
        .context("VAULT_MASTER_KEY_BASE64 is not valid base64")?;
    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("VAULT_MASTER_KEY_BASE64 must decode to 32 bytes, got {}", v.len()))?;
    Ok(Vault::new(EncryptionKey::from_bytes(bytes)))
}

/// Lease and run due jobs on a fixed interval until shutdown is signalled.
async fn job_worker_loop(
    pool: &sqlx::PgPool,
    registry: &HandlerRegistry,
    worker_id: &str,
    limit: i64,
    interval_secs: u64,
    visibility: ChronoDuration,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    info!(interval_secs, worker_id, "job worker started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match jobs::run_once(pool, registry, worker_id, limit, visibility).await {
                    Ok(0) => {}
                    Ok(n) => info!(leased = n, "job worker tick complete"),
                    Err(e) => warn!(error = %e, "job worker tick failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("job worker shutting down");
                    return;
                }
            }
        }
    }
}

/// Compete for cron ticker leadership; once held, tick on a fixed interval
/// until shutdown. If leadership can't be acquired (another process already
/// holds it), keep checking on the same interval rather than busy-looping.
///
/// The advisory lock backing leadership is session-scoped, so the
/// connection that acquires it is held in hand (taken out of the pool via
/// `acquire()`, never returned) for as long as leadership lasts; regular
/// ticks borrow ordinary connections from `pool` for their own queries.
async fn cron_worker_loop(pool: &sqlx::PgPool, interval_secs: u64, shutdown: &mut watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let mut leader_conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if leader_conn.is_none() {
                    match pool.acquire().await {
                        Ok(mut conn) => match cron_scheduler::try_acquire_leadership(&mut conn).await {
                            Ok(true) => {
                                leader_conn = Some(conn);
                                info!("acquired cron ticker leadership");
                            }
                            Ok(false) => continue,
                            Err(e) => {
                                warn!(error = %e, "cron leadership check failed");
                                continue;
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "failed to acquire connection for cron leadership check");
                            continue;
                        }
                    }
                }

                match cron_scheduler::run_tick(pool, chrono::Utc::now()).await {
                    Ok(n) => {
                        if n > 0 {
                            info!(entries = n, "cron tick complete");
                        }
                    }
                    Err(e) => warn!(error = %e, "cron tick failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if let Some(mut conn) = leader_conn.take() {
                        let _ = cron_scheduler::release_leadership(&mut conn).await;
                    }
                    info!("cron worker shutting down");
                    return;
                }
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}

/// Apply production hardening before logging is initialized.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via TENANT_DISABLE_MLOCK — secrets may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: failed to lock memory: {e} (set TENANT_DISABLE_MLOCK=true for dev)");
    }
}
