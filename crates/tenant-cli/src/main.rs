//! Tenant Runtime Core operator CLI.
//!
//! Two families of subcommand:
//!
//! - `serve` / `worker` / `cron` embed `tenant-server`'s bootstrap
//!   directly (no network hop) to run the HTTP API, a standalone job
//!   worker, or a standalone leader-elected cron ticker.
//! - `store` / `token` / `job` talk to an already-running API over HTTP,
//!   exactly like an external collaborator would per `spec.md` §6 — a
//!   thin `reqwest` client with no special access to the database or
//!   vault key.

use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use uuid::Uuid;

use tenant_server::config::ServerConfig;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";

#[derive(Parser)]
#[command(
    name = "tenant-ctl",
    version,
    about = "Operator CLI for the Tenant Runtime Core",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         TENANT_API_ADDR   API base address for admin subcommands (default: http://127.0.0.1:8080)\n\n\
         {DIM}Examples:{RESET}\n  \
         tenant-ctl serve\n  \
         tenant-ctl worker\n  \
         tenant-ctl store create --owner-id 3b1e... --slug acme-co\n  \
         tenant-ctl job enqueue sync --priority high --store-id 3b1e...\n  \
         tenant-ctl token refresh-pass --buffer-mins 90"
    ),
)]
struct Cli {
    /// Tenant Runtime Core API base address, used by admin subcommands.
    #[arg(long, env = "TENANT_API_ADDR", default_value = "http://127.0.0.1:8080")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API plus the job worker and cron ticker in-process.
    Serve,
    /// Run only the job lease/execute loop against the master database.
    Worker,
    /// Run only the leader-elected cron ticker against the master database.
    Cron,
    /// Store, database, hostname, and tenant-resolution administration.
    Store {
        #[command(subcommand)]
        action: StoreCommands,
    },
    /// Integration token (C6) administration and manual refresh passes.
    Token {
        #[command(subcommand)]
        action: TokenCommands,
    },
    /// Job engine (C8) administration.
    Job {
        #[command(subcommand)]
        action: JobCommands,
    },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// Create a store (status `pending_database`, inactive).
    Create {
        /// Owning user id.
        #[arg(long)]
        owner_id: Uuid,
        /// Store slug (`[a-z0-9-]+`, unique).
        #[arg(long)]
        slug: String,
    },
    /// Fetch a store by id.
    Get {
        store_id: Uuid,
    },
    /// Attach (or replace) a store's primary tenant database.
    AttachDatabase {
        store_id: Uuid,
        /// `supabase`, `postgresql`, or `mysql`.
        #[arg(long = "type")]
        database_type: String,
        #[arg(long)]
        connection_string: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<i32>,
        #[arg(long)]
        database_name: Option<String>,
    },
    /// Bind a hostname to a store.
    AddHostname {
        store_id: Uuid,
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long)]
        primary: bool,
        #[arg(long)]
        custom_domain: bool,
    },
    /// Resolve a request to a store id, trying header/query/hostname/slug
    /// in order, the same chain the runtime itself uses (`spec.md` §4.3).
    Resolve {
        #[arg(long)]
        store_id: Option<Uuid>,
        #[arg(long)]
        slug: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Probe a store's tenant database health.
    Health {
        store_id: Uuid,
    },
    /// Re-run migrations + seed data against a store's tenant database.
    Reprovision {
        store_id: Uuid,
        /// Email of the store owner, mirrored into the seeded owner user.
        #[arg(long)]
        owner_email: String,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Store (or rotate) an integration's OAuth credentials.
    Upsert {
        store_id: Uuid,
        #[arg(long)]
        integration_type: String,
        #[arg(long)]
        config_key: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// RFC 3339 timestamp the access token expires at.
        #[arg(long)]
        expires_at: String,
        /// RFC 3339 timestamp the refresh token expires at, if any.
        #[arg(long)]
        refresh_expires_at: Option<String>,
        #[arg(long, default_value_t = 5)]
        max_failures: u32,
    },
    /// Fetch a token's derived status (never the underlying secret).
    Get {
        store_id: Uuid,
        integration_type: String,
        config_key: String,
    },
    /// Trigger one Token Refresh Scheduler (C7) pass immediately.
    RefreshPass {
        #[arg(long)]
        buffer_mins: Option<i64>,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Submit a job.
    Enqueue {
        job_type: String,
        /// JSON payload, passed through opaque to the handler.
        #[arg(long, default_value = "null")]
        payload: String,
        /// `low`, `normal`, `high`, or `urgent`.
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        store_id: Option<Uuid>,
        #[arg(long)]
        user_id: Option<Uuid>,
        #[arg(long)]
        dedupe_key: Option<String>,
    },
    /// Fetch a job's current state.
    Get {
        job_id: Uuid,
    },
    /// Request cancellation (immediate if pending, cooperative if running).
    Cancel {
        job_id: Uuid,
    },
    /// Record progress on a running job.
    Progress {
        job_id: Uuid,
        #[arg(long)]
        progress: f32,
        #[arg(long)]
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{RED}{BOLD}error:{RESET} {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve => {
            init_tracing();
            tenant_server::bootstrap::run(ServerConfig::from_env()).await
        }
        Commands::Worker => {
            init_tracing();
            tenant_server::bootstrap::run_job_worker(ServerConfig::from_env()).await
        }
        Commands::Cron => {
            init_tracing();
            tenant_server::bootstrap::run_cron_ticker(ServerConfig::from_env()).await
        }
        Commands::Store { action } => cmd_store(&Client::new(cli.addr), action).await,
        Commands::Token { action } => cmd_token(&Client::new(cli.addr), action).await,
        Commands::Job { action } => cmd_job(&Client::new(cli.addr), action).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

// ── admin subcommand handlers ────────────────────────────────────────

async fn cmd_store(client: &Client, action: StoreCommands) -> Result<()> {
    match action {
        StoreCommands::Create { owner_id, slug } => {
            let body = client.post("/v1/stores", &json!({"owner_id": owner_id, "slug": slug})).await?;
            print_json(&body);
        }
        StoreCommands::Get { store_id } => {
            let body = client.get(&format!("/v1/stores/{store_id}")).await?;
            print_json(&body);
        }
        StoreCommands::AttachDatabase {
            store_id,
            database_type,
            connection_string,
            host,
            port,
            database_name,
        } => {
            let body = client
                .post(
                    &format!("/v1/stores/{store_id}/database"),
                    &json!({
                        "database_type": database_type,
                        "connection_string": connection_string,
                        "host": host,
                        "port": port,
                        "database_name": database_name,
                    }),
                )
                .await?;
            print_json(&body);
        }
        StoreCommands::AddHostname {
            store_id,
            hostname,
            slug,
            primary,
            custom_domain,
        } => {
            let body = client
                .post(
                    &format!("/v1/stores/{store_id}/hostnames"),
                    &json!({
                        "hostname": hostname,
                        "slug": slug,
                        "is_primary": primary,
                        "is_custom_domain": custom_domain,
                    }),
                )
                .await?;
            print_json(&body);
        }
        StoreCommands::Resolve { store_id, slug, hostname } => {
            let mut path = "/v1/resolve".to_owned();
            let mut params = Vec::new();
            if let Some(id) = store_id {
                params.push(format!("store_id={id}"));
            }
            if let Some(s) = &slug {
                params.push(format!("slug={s}"));
            }
            if !params.is_empty() {
                path = format!("{path}?{}", params.join("&"));
            }
            let body = if let Some(host) = hostname {
                client.get_with_host(&path, &host).await?
            } else {
                client.get(&path).await?
            };
            print_json(&body);
        }
        StoreCommands::Health { store_id } => {
            let body = client.get(&format!("/v1/stores/{store_id}/health")).await?;
            print_json(&body);
        }
        StoreCommands::Reprovision { store_id, owner_email } => {
            let body = client
                .post(&format!("/v1/stores/{store_id}/reprovision"), &json!({"owner_email": owner_email}))
                .await?;
            println!("{GREEN}reprovisioned{RESET}");
            print_json(&body);
        }
    }
    Ok(())
}

async fn cmd_token(client: &Client, action: TokenCommands) -> Result<()> {
    match action {
        TokenCommands::Upsert {
            store_id,
            integration_type,
            config_key,
            access_token,
            refresh_token,
            expires_at,
            refresh_expires_at,
            max_failures,
        } => {
            let body = client
                .post(
                    &format!("/v1/stores/{store_id}/tokens"),
                    &json!({
                        "integration_type": integration_type,
                        "config_key": config_key,
                        "access_token": access_token,
                        "refresh_token": refresh_token,
                        "token_expires_at": expires_at,
                        "refresh_token_expires_at": refresh_expires_at,
                        "max_failures": max_failures,
                    }),
                )
                .await?;
            print_json(&body);
        }
        TokenCommands::Get { store_id, integration_type, config_key } => {
            let body =
                client.get(&format!("/v1/stores/{store_id}/tokens/{integration_type}/{config_key}")).await?;
            print_json(&body);
        }
        TokenCommands::RefreshPass { buffer_mins } => {
            let path = match buffer_mins {
                Some(m) => format!("/v1/tokens/refresh-pass?buffer_mins={m}"),
                None => "/v1/tokens/refresh-pass".to_owned(),
            };
            let body = client.post(&path, &Value::Null).await?;
            print_json(&body);
        }
    }
    Ok(())
}

async fn cmd_job(client: &Client, action: JobCommands) -> Result<()> {
    match action {
        JobCommands::Enqueue { job_type, payload, priority, max_retries, store_id, user_id, dedupe_key } => {
            let payload: Value = serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let body = client
                .post(
                    "/v1/jobs",
                    &json!({
                        "job_type": job_type,
                        "payload": payload,
                        "priority": priority,
                        "max_retries": max_retries,
                        "store_id": store_id,
                        "user_id": user_id,
                        "dedupe_key": dedupe_key,
                    }),
                )
                .await?;
            print_json(&body);
        }
        JobCommands::Get { job_id } => {
            let body = client.get(&format!("/v1/jobs/{job_id}")).await?;
            print_json(&body);
        }
        JobCommands::Cancel { job_id } => {
            let body = client.post(&format!("/v1/jobs/{job_id}/cancel"), &Value::Null).await?;
            print_json(&body);
        }
        JobCommands::Progress { job_id, progress, message } => {
            client
                .post(&format!("/v1/jobs/{job_id}/progress"), &json!({"progress": progress, "message": message}))
                .await?;
            println!("{GREEN}progress recorded{RESET}");
        }
    }
    Ok(())
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(_) => println!("{value}"),
    }
}

// ── HTTP client ──────────────────────────────────────────────────────

struct Client {
    http: reqwest::Client,
    addr: String,
}

impl Client {
    fn new(addr: String) -> Self {
        Self { http: reqwest::Client::new(), addr }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.addr)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self.http.get(self.url(path)).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn get_with_host(&self, path: &str, host: &str) -> Result<Value> {
        let resp = self.http.get(self.url(path)).header("Host", host).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self.http.post(self.url(path)).json(body).send().await.context("request failed")?;
        handle_response(resp).await
    }
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let body = resp.text().await.context("failed to read response body")?;
    if !status.is_success() {
        bail!("server returned {status}: {body}");
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("failed to parse response JSON")
}

