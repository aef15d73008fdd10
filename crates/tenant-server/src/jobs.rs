//! Job Engine (C8) — the durable, prioritized queue persisted in
//! `jobs`/`job_history`, and the background worker that leases and runs
//! them.
//!
//! Every state transition itself lives in [`tenant_core::jobs::Job`] as a
//! pure function; this module's only job is moving rows in and out of
//! Postgres around those calls, following the repository pattern the
//! teacher uses throughout its cloud storage layer: one `async fn(&PgPool,
//! ...) -> Result<T, JobsError>` per operation, `sqlx::query_as` bound
//! positionally, `FOR UPDATE SKIP LOCKED` for safe concurrent leasing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use tenant_core::error::JobError;
use tenant_core::jobs::{Job, JobHistoryEntry, JobPriority, JobStatus, JobTransition};

/// Errors from the job repository.
#[derive(Debug, thiserror::Error)]
pub enum JobsError {
    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error("job transition rejected: {0}")]
    Transition(#[from] JobError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// The raw `jobs` row, as read from Postgres.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: serde_json::Value,
    status: String,
    priority: String,
    scheduled_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    store_id: Option<Uuid>,
    user_id: Option<Uuid>,
    metadata: serde_json::Value,
    dedupe_key: Option<String>,
    retry_count: i32,
    max_retries: i32,
    progress: Option<f32>,
    progress_message: Option<String>,
    result: Option<serde_json::Value>,
    #[sqlx(rename = "last_error")]
    error: Option<String>,
}

fn status_to_wire(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelling => "cancelling",
        JobStatus::Cancelled => "cancelled",
    }
}

fn status_from_wire(wire: &str) -> JobStatus {
    match wire {
        "running" => JobStatus::Running,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelling" => JobStatus::Cancelling,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Pending,
    }
}

fn priority_to_wire(priority: JobPriority) -> &'static str {
    match priority {
        JobPriority::Low => "low",
        JobPriority::Normal => "normal",
        JobPriority::High => "high",
        JobPriority::Urgent => "urgent",
    }
}

fn priority_from_wire(wire: &str) -> JobPriority {
    match wire {
        "low" => JobPriority::Low,
        "high" => JobPriority::High,
        "urgent" => JobPriority::Urgent,
        _ => JobPriority::Normal,
    }
}

fn transition_to_wire(transition: JobTransition) -> &'static str {
    match transition {
        JobTransition::Started => "started",
        JobTransition::Completed => "completed",
        JobTransition::FailedRetrying => "failed_retrying",
        JobTransition::FailedTerminal => "failed_terminal",
        JobTransition::CancelRequested => "cancel_requested",
        JobTransition::Cancelled => "cancelled",
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            job_type: row.job_type,
            payload: row.payload,
            status: status_from_wire(&row.status),
            priority: priority_from_wire(&row.priority),
            scheduled_at: row.scheduled_at,
            created_at: row.created_at,
            store_id: row.store_id,
            user_id: row.user_id,
            metadata: row.metadata,
            dedupe_key: row.dedupe_key,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            progress: row.progress,
            progress_message: row.progress_message,
            result: row.result,
            error: row.error,
        }
    }
}

/// Persist a newly constructed [`Job`] in `pending` status.
///
/// # Errors
///
/// Returns [`JobsError::Database`] if a live `dedupe_key` already exists
/// (unique constraint `jobs_dedupe_key_live`).
pub async fn enqueue(pool: &PgPool, job: &Job) -> Result<(), JobsError> {
    sqlx::query(
        r"INSERT INTO jobs
            (id, job_type, payload, status, priority, scheduled_at, created_at,
             store_id, user_id, metadata, dedupe_key, retry_count, max_retries)
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(job.id)
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(status_to_wire(job.status))
    .bind(priority_to_wire(job.priority))
    .bind(job.scheduled_at)
    .bind(job.created_at)
    .bind(job.store_id)
    .bind(job.user_id)
    .bind(&job.metadata)
    .bind(&job.dedupe_key)
    .bind(i32::try_from(job.retry_count).unwrap_or(i32::MAX))
    .bind(i32::try_from(job.max_retries).unwrap_or(i32::MAX))
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist a newly constructed [`Job`], collapsing onto an existing
/// pending/running job with the same `dedupe_key` rather than erroring.
///
/// Mirrors the `ON CONFLICT DO UPDATE` upsert idiom used for store
/// hostnames and integration tokens: attempt the insert, and if the
/// partial unique index on live `dedupe_key`s rejects it, look up the
/// job it collided with instead of surfacing a database error to the
/// caller. Returns the id of whichever job now represents this
/// dedupe key — the one just inserted, or the one already live.
///
/// # Errors
///
/// Returns [`JobsError::Database`] for any failure other than a
/// `dedupe_key` collision.
pub async fn submit(pool: &PgPool, job: &Job) -> Result<Uuid, JobsError> {
    match enqueue(pool, job).await {
        Ok(()) => Ok(job.id),
        Err(JobsError::Database(sqlx::Error::Database(db_err)))
            if db_err.code().as_deref() == Some("23505")
                && db_err.constraint() == Some("jobs_dedupe_key_live") =>
        {
            let Some(dedupe_key) = &job.dedupe_key else {
                return Err(JobsError::Database(sqlx::Error::Database(db_err)));
            };
            let row = sqlx::query_as::<_, JobRow>(
                r"SELECT * FROM jobs
                  WHERE dedupe_key = $1 AND status IN ('pending', 'running', 'cancelling')
                  LIMIT 1",
            )
            .bind(dedupe_key)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| JobsError::Database(sqlx::Error::Database(db_err)))?;
            Ok(row.id)
        }
        Err(e) => Err(e),
    }
}

/// Fetch a job by id.
///
/// # Errors
///
/// Returns [`JobsError::NotFound`] if no such job exists.
pub async fn get(pool: &PgPool, job_id: Uuid) -> Result<Job, JobsError> {
    let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or(JobsError::NotFound(job_id))?;
    Ok(row.into())
}

/// A leased job, ready for a handler to run.
pub struct LeasedJob {
    pub job: Job,
}

/// Lease up to `limit` due jobs (`pending`, `scheduled_at <= now`),
/// ordered `priority desc, scheduled_at asc, created_at asc`, skipping
/// rows already locked by another worker.
///
/// Each leased row's `lease_expires_at` is set to `now + visibility`; see
/// [`reclaim_stale`] for what happens if the worker never reports back.
///
/// # Errors
///
/// Returns [`JobsError::Database`] on a query failure.
pub async fn lease(
    pool: &PgPool,
    worker_id: &str,
    now: DateTime<Utc>,
    limit: i64,
    visibility: chrono::Duration,
) -> Result<Vec<LeasedJob>, JobsError> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query_as::<_, JobRow>(
        r"SELECT * FROM jobs
          WHERE status = 'pending' AND scheduled_at <= $1
          ORDER BY
            CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END,
            scheduled_at ASC, created_at ASC
          LIMIT $2
          FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;

    let lease_expires_at = now + visibility;
    let mut leased = Vec::with_capacity(rows.len());
    for row in rows {
        let job: Job = row.into();
        let (started, history) = job.start(now)?;
        persist_transition(&mut tx, &started, &history).await?;
        sqlx::query("UPDATE jobs SET leased_by = $2, started_at = $3, lease_expires_at = $4 WHERE id = $1")
            .bind(started.id)
            .bind(worker_id)
            .bind(now)
            .bind(lease_expires_at)
            .execute(&mut *tx)
            .await?;
        leased.push(LeasedJob { job: started });
    }

    tx.commit().await?;
    Ok(leased)
}

/// Reclaim jobs whose lease has expired without the worker reporting
/// back — at-least-once delivery per `spec.md` §4.8: a worker that
/// crashed mid-job leaves its row `running` forever unless something
/// notices the lease timed out and runs it back through the normal
/// failure/retry path.
///
/// Uses the same `fail` transition as a handler-reported error, so a
/// stale lease consumes one unit of the job's retry budget exactly like
/// any other failure, and is recorded in `job_history` with a
/// `lease_expired` error message.
///
/// # Errors
///
/// Returns [`JobsError::Database`] on a query failure.
pub async fn reclaim_stale(pool: &PgPool, now: DateTime<Utc>) -> Result<usize, JobsError> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query_as::<_, JobRow>(
        r"SELECT * FROM jobs
          WHERE status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at < $1
          FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    let count = rows.len();
    for row in rows {
        let job: Job = row.into();
        let (failed, history) = job.fail("lease_expired: worker did not report back before visibility timeout", now)?;
        persist_transition(&mut tx, &failed, &history).await?;
        sqlx::query(
            r"UPDATE jobs SET
                status = $2, scheduled_at = $3, retry_count = $4, last_error = $5,
                leased_by = NULL, lease_expires_at = NULL,
                failed_at = CASE WHEN $2 = 'failed' THEN $6 ELSE failed_at END
              WHERE id = $1",
        )
        .bind(failed.id)
        .bind(status_to_wire(failed.status))
        .bind(failed.scheduled_at)
        .bind(i32::try_from(failed.retry_count).unwrap_or(i32::MAX))
        .bind(&failed.error)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(count)
}

/// Record progress on a leased job.
///
/// # Errors
///
/// Returns [`JobsError::Transition`] if the job is not running, or
/// [`JobsError::NotFound`] if it no longer exists.
pub async fn update_progress(
    pool: &PgPool,
    job_id: Uuid,
    progress: f32,
    message: Option<String>,
) -> Result<(), JobsError> {
    let mut job = get(pool, job_id).await?;
    job.update_progress(progress, message)?;
    sqlx::query("UPDATE jobs SET progress = $2, progress_message = $3 WHERE id = $1")
        .bind(job_id)
        .bind(job.progress)
        .bind(&job.progress_message)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a leased job completed, recording `result`.
///
/// # Errors
///
/// Returns [`JobsError::Transition`] if the job is not running/cancelling.
pub async fn complete(pool: &PgPool, leased: LeasedJob, result: serde_json::Value, now: DateTime<Utc>) -> Result<(), JobsError> {
    let (done, history) = leased.job.complete(result, now)?;
    let mut tx = pool.begin().await?;
    persist_transition(&mut tx, &done, &history).await?;
    sqlx::query("UPDATE jobs SET completed_at = $2, result = $3, leased_by = NULL, lease_expires_at = NULL WHERE id = $1")
        .bind(done.id)
        .bind(now)
        .bind(&done.result)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Mark a leased job failed, retrying with backoff if its budget allows.
///
/// # Errors
///
/// Returns [`JobsError::Transition`] if the job is not running/cancelling.
pub async fn fail(pool: &PgPool, leased: LeasedJob, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), JobsError> {
    let (failed, history) = leased.job.fail(error, now)?;
    let mut tx = pool.begin().await?;
    persist_transition(&mut tx, &failed, &history).await?;
    sqlx::query(
        r"UPDATE jobs SET
            status = $2, scheduled_at = $3, retry_count = $4, last_error = $5,
            leased_by = NULL, lease_expires_at = NULL,
            failed_at = CASE WHEN $2 = 'failed' THEN $6 ELSE failed_at END
          WHERE id = $1",
    )
    .bind(failed.id)
    .bind(status_to_wire(failed.status))
    .bind(failed.scheduled_at)
    .bind(i32::try_from(failed.retry_count).unwrap_or(i32::MAX))
    .bind(&failed.error)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Request cancellation of a job by id, whether it is pending or
/// currently leased.
///
/// # Errors
///
/// Returns [`JobsError::Transition`] if the job is already terminal, or
/// [`JobsError::NotFound`] if it doesn't exist.
pub async fn request_cancel(pool: &PgPool, job_id: Uuid, now: DateTime<Utc>) -> Result<(), JobsError> {
    let job = get(pool, job_id).await?;
    let (updated, history) = job.request_cancel(now)?;
    let mut tx = pool.begin().await?;
    persist_transition(&mut tx, &updated, &history).await?;
    sqlx::query("UPDATE jobs SET status = $2, cancelled_at = CASE WHEN $2 = 'cancelled' THEN $3 ELSE cancelled_at END WHERE id = $1")
        .bind(job_id)
        .bind(status_to_wire(updated.status))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

async fn persist_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job: &Job,
    history: &JobHistoryEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE jobs SET status = $2 WHERE id = $1")
        .bind(job.id)
        .bind(status_to_wire(job.status))
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        r"INSERT INTO job_history (job_id, transition, status_after, executed_at, duration_ms, error)
          VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(history.job_id)
    .bind(transition_to_wire(history.transition))
    .bind(status_to_wire(history.status_after))
    .bind(history.executed_at)
    .bind(history.duration_ms)
    .bind(&history.error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// A job handler: runs a leased job's `job_type`-specific logic and
/// returns a result payload, or an error message to be recorded via
/// [`fail`].
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<serde_json::Value, String>;
}

/// Maps `job_type` to the [`JobHandler`] that runs it. Unregistered job
/// types fail immediately on lease rather than looping forever.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Build a registry from a `job_type -> handler` map.
    #[must_use]
    pub fn new(handlers: HashMap<String, Arc<dyn JobHandler>>) -> Self {
        Self { handlers: Arc::new(handlers) }
    }

    #[must_use]
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }
}

/// Run one reclaim-lease-execute-finalize cycle: first reclaim any job
/// whose lease expired since the last tick (§4.8's at-least-once
/// semantics), then lease up to `limit` due jobs and dispatch each to its
/// registered handler. Jobs with no registered handler fail immediately
/// with a descriptive error (counted against their retry budget like any
/// other failure).
pub async fn run_once(
    pool: &PgPool,
    registry: &HandlerRegistry,
    worker_id: &str,
    limit: i64,
    visibility: chrono::Duration,
) -> Result<usize, JobsError> {
    let now = Utc::now();

    match reclaim_stale(pool, now).await {
        Ok(0) => {}
        Ok(n) => tracing::warn!(reclaimed = n, "reclaimed jobs with an expired lease"),
        Err(e) => tracing::error!(error = %e, "failed to reclaim stale leases"),
    }

    let leased = lease(pool, worker_id, now, limit, visibility).await?;
    let count = leased.len();

    for item in leased {
        let job_type = item.job.job_type.clone();
        match registry.get(&job_type) {
            Some(handler) => match handler.run(&item.job).await {
                Ok(result) => {
                    if let Err(e) = complete(pool, item, result, Utc::now()).await {
                        tracing::error!(error = %e, job_type, "failed to record job completion");
                    }
                }
                Err(reason) => {
                    if let Err(e) = fail(pool, item, reason, Utc::now()).await {
                        tracing::error!(error = %e, job_type, "failed to record job failure");
                    }
                }
            },
            None => {
                let reason = format!("no handler registered for job_type '{job_type}'");
                if let Err(e) = fail(pool, item, reason, Utc::now()).await {
                    tracing::error!(error = %e, job_type, "failed to record unhandled job failure");
                }
            }
        }
    }

    Ok(count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrips_for_status_and_priority() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelling,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status_from_wire(status_to_wire(status)), status);
        }
        for priority in [JobPriority::Low, JobPriority::Normal, JobPriority::High, JobPriority::Urgent] {
            assert_eq!(priority_from_wire(priority_to_wire(priority)), priority);
        }
    }

    #[tokio::test]
    async fn handler_registry_dispatches_by_job_type() {
        struct Echo;
        #[async_trait::async_trait]
        impl JobHandler for Echo {
            async fn run(&self, job: &Job) -> Result<serde_json::Value, String> {
                Ok(job.payload.clone())
            }
        }

        let mut handlers: HashMap<String, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert("echo".to_owned(), Arc::new(Echo));
        let registry = HandlerRegistry::new(handlers);

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }
}
