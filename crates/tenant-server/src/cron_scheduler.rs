//! Cron Scheduler (C9) — persistence for `cron_jobs`/`cron_job_executions`
//! plus the cluster-wide leader-elected tick loop.
//!
//! [`tenant_core::cron`] owns the pure per-entry decision (`tick`); this
//! module owns everything around it: loading due rows with `FOR UPDATE
//! SKIP LOCKED` (the same leasing idiom [`crate::jobs::lease`] uses),
//! calling into the Job Engine to actually enqueue, and leader election via
//! a single Postgres advisory lock so only one server process runs the
//! ticker even when several are deployed behind a load balancer.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use uuid::Uuid;

use tenant_core::cron::{tick, CronEntry, TickOutcome};
use tenant_core::error::CronError;
use tenant_core::jobs::{Job, JobPriority};

use crate::jobs::JobsError;

/// A single advisory lock key for cron ticker leadership. Any `i64` works
/// as long as every server process agrees on it; this one is arbitrary.
const LEADER_LOCK_KEY: i64 = 0x7454_4e41_4e54_4352;

/// Errors from the cron scheduler's persistence and leader-election layer.
#[derive(Debug, thiserror::Error)]
pub enum CronSchedulerError {
    #[error("cron entry error: {0}")]
    Cron(#[from] CronError),

    #[error("job engine error: {0}")]
    Jobs(#[from] JobsError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct CronRow {
    id: Uuid,
    job_type: String,
    configuration: serde_json::Value,
    cron_expression: String,
    timezone: String,
    is_active: bool,
    is_paused: bool,
    next_run_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    max_failures: i32,
}

impl CronRow {
    fn into_entry(self) -> Result<CronEntry, CronSchedulerError> {
        let timezone = Tz::from_str(&self.timezone).map_err(|_| {
            CronError::InvalidExpression {
                expression: self.cron_expression.clone(),
                reason: format!("unknown timezone '{}'", self.timezone),
            }
        })?;
        Ok(CronEntry {
            id: self.id,
            job_type: self.job_type,
            configuration: self.configuration,
            cron_expression: self.cron_expression,
            timezone,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            is_active: self.is_active,
            is_paused: self.is_paused,
            consecutive_failures: self.consecutive_failures.max(0) as u32,
            max_failures: self.max_failures.max(0) as u32,
        })
    }
}

fn outcome_to_wire(outcome: &TickOutcome) -> &'static str {
    match outcome {
        TickOutcome::NotDue => "not_due",
        TickOutcome::Fired => "fired",
        TickOutcome::FireFailed => "fire_failed",
        TickOutcome::Paused => "paused",
        TickOutcome::SkippedNoUpcomingOccurrence => "skipped_no_upcoming_occurrence",
    }
}

/// Attempt to become the cluster-wide cron ticker leader.
///
/// `pg_try_advisory_lock`/`pg_advisory_unlock` are scoped to the backend
/// session that takes them, so the lock must be taken and released on the
/// *same* physical connection — never through `&PgPool`, which would hand
/// out whichever connection happens to be free on each call. Callers take
/// a dedicated connection with `pool.acquire()` and hold it in hand for as
/// long as they hold leadership; see `cron_worker_loop`.
///
/// Returns `true` if this call acquired the lock, `false` if another
/// process already holds it.
///
/// # Errors
///
/// Returns [`CronSchedulerError::Database`] on a query failure.
pub async fn try_acquire_leadership(conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>) -> Result<bool, CronSchedulerError> {
    let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .bind(LEADER_LOCK_KEY)
        .fetch_one(&mut **conn)
        .await?;
    Ok(acquired)
}

/// Release the leadership lock on the same connection that acquired it,
/// e.g. on graceful shutdown.
///
/// # Errors
///
/// Returns [`CronSchedulerError::Database`] on a query failure.
pub async fn release_leadership(conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>) -> Result<(), CronSchedulerError> {
    sqlx::query("SELECT pg_advisory_unlock($1)").bind(LEADER_LOCK_KEY).execute(&mut **conn).await?;
    Ok(())
}

/// Run one full tick: lease every due cron entry (`FOR UPDATE SKIP
/// LOCKED`, mirroring [`crate::jobs::lease`]), submit a job for each, and
/// persist the resulting entry state plus a `cron_job_executions` row.
///
/// Returns the number of entries evaluated (including ones found `NotDue`
/// by a race between the due-scan and the per-row lock).
///
/// # Errors
///
/// Returns [`CronSchedulerError::Database`] if the initial scan fails.
pub async fn run_tick(pool: &PgPool, now: DateTime<Utc>) -> Result<usize, CronSchedulerError> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query_as::<_, CronRow>(
        r"SELECT * FROM cron_jobs
          WHERE is_active AND NOT is_paused AND next_run_at <= $1
          FOR UPDATE SKIP LOCKED",
    )
    .bind(now)
    .fetch_all(&mut *tx)
    .await?;

    let count = rows.len();

    for row in rows {
        let cron_job_id = row.id;
        let entry = match row.into_entry() {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(%cron_job_id, error = %e, "skipping cron entry with invalid timezone");
                continue;
            }
        };

        let job = Job::enqueue(
            entry.job_type.clone(),
            entry.configuration.clone(),
            JobPriority::Normal,
            now,
            now,
            3,
            None,
            None,
            serde_json::json!({ "cron_job_id": cron_job_id }),
            None,
        );

        let (job_id, enqueue_succeeded) = match job {
            Ok(job) => match crate::jobs::submit(pool, &job).await {
                Ok(id) => (Some(id), true),
                Err(e) => {
                    tracing::warn!(%cron_job_id, error = %e, "cron tick failed to enqueue job");
                    (None, false)
                }
            },
            Err(e) => {
                tracing::warn!(%cron_job_id, error = %e, "cron entry produced an invalid job definition");
                (None, false)
            }
        };

        let (updated, outcome) = tick(entry, now, |_| enqueue_succeeded)?;

        sqlx::query(
            r"UPDATE cron_jobs SET
                next_run_at = $2, last_run_at = $3, is_paused = $4, consecutive_failures = $5
              WHERE id = $1",
        )
        .bind(updated.id)
        .bind(updated.next_run_at)
        .bind(updated.last_run_at)
        .bind(updated.is_paused)
        .bind(i32::try_from(updated.consecutive_failures).unwrap_or(i32::MAX))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"INSERT INTO cron_job_executions (cron_job_id, job_id, outcome, executed_at)
              VALUES ($1, $2, $3, $4)",
        )
        .bind(cron_job_id)
        .bind(job_id)
        .bind(outcome_to_wire(&outcome))
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn outcome_wire_values_are_stable() {
        assert_eq!(outcome_to_wire(&TickOutcome::NotDue), "not_due");
        assert_eq!(outcome_to_wire(&TickOutcome::Fired), "fired");
        assert_eq!(outcome_to_wire(&TickOutcome::FireFailed), "fire_failed");
        assert_eq!(outcome_to_wire(&TickOutcome::Paused), "paused");
        assert_eq!(
            outcome_to_wire(&TickOutcome::SkippedNoUpcomingOccurrence),
            "skipped_no_upcoming_occurrence"
        );
    }

    #[test]
    fn cron_row_rejects_unknown_timezone() {
        let row = CronRow {
            id: Uuid::new_v4(),
            job_type: "refresh_tokens".to_owned(),
            configuration: serde_json::json!({}),
            cron_expression: "*/30 * * * *".to_owned(),
            timezone: "Not/A_Zone".to_owned(),
            is_active: true,
            is_paused: false,
            next_run_at: Utc::now(),
            last_run_at: None,
            consecutive_failures: 0,
            max_failures: 5,
        };
        assert!(row.into_entry().is_err());
    }
}
