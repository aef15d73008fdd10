//! Job state machine (C8).
//!
//! Every transition here is a pure function: given a [`Job`] and the
//! current time, produce the next [`Job`] plus the [`JobHistoryEntry`] row
//! describing the transition. Persistence and leasing (which rows are
//! `pending` with `scheduled_at <= now`, locked via
//! `SELECT ... FOR UPDATE SKIP LOCKED`) are a `tenant-server` concern;
//! nothing here touches a database.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JobError, JobStatusLabel};
use crate::jobs::backoff::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, backoff};

/// Relative scheduling priority. Leasing orders by `priority desc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A job's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Cancellation requested on a running job; cooperative, not yet
    /// observed by the worker.
    Cancelling,
    Cancelled,
}

impl JobStatus {
    fn label(self) -> JobStatusLabel {
        match self {
            Self::Pending => JobStatusLabel::Queued,
            Self::Running => JobStatusLabel::Running,
            Self::Completed => JobStatusLabel::Completed,
            Self::Failed => JobStatusLabel::Failed,
            Self::Cancelling => JobStatusLabel::Cancelling,
            Self::Cancelled => JobStatusLabel::Cancelled,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A single durable background job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub store_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub metadata: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub progress: Option<f32>,
    pub progress_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Job {
    /// Construct a new job in `pending` status, as produced by `enqueue`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidDefinition`] if `job_type` is empty or
    /// `max_retries` is zero (a job that can never retry should still be
    /// expressible, but the caller must say so as `max_retries = 0`
    /// deliberately is allowed — only an empty type is rejected).
    pub fn enqueue(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        priority: JobPriority,
        scheduled_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
        max_retries: u32,
        store_id: Option<Uuid>,
        user_id: Option<Uuid>,
        metadata: serde_json::Value,
        dedupe_key: Option<String>,
    ) -> Result<Self, JobError> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(JobError::InvalidDefinition {
                reason: "job_type must not be empty".to_owned(),
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            job_type,
            payload,
            status: JobStatus::Pending,
            priority,
            scheduled_at,
            created_at,
            store_id,
            user_id,
            metadata,
            dedupe_key,
            retry_count: 0,
            max_retries,
            progress: None,
            progress_message: None,
            result: None,
            error: None,
        })
    }

    /// Transition `pending -> running`, as performed by `lease`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::IllegalTransition`] if the job is not `pending`.
    pub fn start(mut self, now: DateTime<Utc>) -> Result<(Self, JobHistoryEntry), JobError> {
        self.require(JobStatus::Pending)?;
        self.status = JobStatus::Running;
        Ok((self.clone(), JobHistoryEntry::new(&self, JobTransition::Started, now, None)))
    }

    /// Record progress on a job that is actively running or has a pending
    /// cancellation request.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::IllegalTransition`] if the job is not `running`
    /// or `cancelling`.
    pub fn update_progress(
        &mut self,
        progress: f32,
        message: Option<String>,
    ) -> Result<(), JobError> {
        if !matches!(self.status, JobStatus::Running | JobStatus::Cancelling) {
            return Err(JobError::IllegalTransition {
                job_id: self.id,
                from: self.status.label(),
                to: JobStatusLabel::Running,
            });
        }
        self.progress = Some(progress.clamp(0.0, 1.0));
        self.progress_message = message;
        Ok(())
    }

    /// Transition `running -> completed`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::IllegalTransition`] if the job is not `running`
    /// or `cancelling` (a job may finish successfully before observing a
    /// cooperative cancel request — that outcome stands).
    pub fn complete(
        mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(Self, JobHistoryEntry), JobError> {
        if !matches!(self.status, JobStatus::Running | JobStatus::Cancelling) {
            return Err(JobError::IllegalTransition {
                job_id: self.id,
                from: self.status.label(),
                to: JobStatusLabel::Completed,
            });
        }
        let duration_ms = duration_since_ms(self.created_at, now);
        self.status = JobStatus::Completed;
        self.result = Some(result);
        Ok((
            self.clone(),
            JobHistoryEntry::new(&self, JobTransition::Completed, now, Some(duration_ms)),
        ))
    }

    /// Transition `running -> pending` (retry with backoff) or `running ->
    /// failed` (terminal), depending on whether the retry budget remains.
    ///
    /// A job that was `cancelling` when it failed still runs this rule —
    /// the failure outcome stands per the cooperative-cancel contract.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::IllegalTransition`] if the job is not `running`
    /// or `cancelling`.
    pub fn fail(
        mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(Self, JobHistoryEntry), JobError> {
        self.fail_with_backoff(error, now, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
    }

    /// As [`fail`](Self::fail), with an explicit backoff base/cap (used by
    /// tests and by deployments that override the defaults).
    pub fn fail_with_backoff(
        mut self,
        error: impl Into<String>,
        now: DateTime<Utc>,
        base: Duration,
        cap: Duration,
    ) -> Result<(Self, JobHistoryEntry), JobError> {
        if !matches!(self.status, JobStatus::Running | JobStatus::Cancelling) {
            return Err(JobError::IllegalTransition {
                job_id: self.id,
                from: self.status.label(),
                to: JobStatusLabel::Failed,
            });
        }
        self.error = Some(error.into());

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            let delay = backoff(self.retry_count, base, cap);
            self.status = JobStatus::Pending;
            self.scheduled_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            Ok((
                self.clone(),
                JobHistoryEntry::new(&self, JobTransition::FailedRetrying, now, None),
            ))
        } else {
            self.status = JobStatus::Failed;
            Ok((
                self.clone(),
                JobHistoryEntry::new(&self, JobTransition::FailedTerminal, now, None),
            ))
        }
    }

    /// Request cancellation. A `pending` job is cancelled immediately; a
    /// `running` job moves to `cancelling` and must be observed by the
    /// worker via [`observe_cancellation`](Self::observe_cancellation).
    ///
    /// # Errors
    ///
    /// Returns [`JobError::IllegalTransition`] if the job is already in a
    /// terminal state.
    pub fn request_cancel(mut self, now: DateTime<Utc>) -> Result<(Self, JobHistoryEntry), JobError> {
        match self.status {
            JobStatus::Pending => {
                self.status = JobStatus::Cancelled;
                Ok((
                    self.clone(),
                    JobHistoryEntry::new(&self, JobTransition::Cancelled, now, None),
                ))
            }
            JobStatus::Running => {
                self.status = JobStatus::Cancelling;
                Ok((
                    self.clone(),
                    JobHistoryEntry::new(&self, JobTransition::CancelRequested, now, None),
                ))
            }
            JobStatus::Cancelling => Err(JobError::IllegalTransition {
                job_id: self.id,
                from: self.status.label(),
                to: JobStatusLabel::Cancelling,
            }),
            terminal => Err(JobError::IllegalTransition {
                job_id: self.id,
                from: terminal.label(),
                to: JobStatusLabel::Cancelled,
            }),
        }
    }

    /// The worker's acknowledgment that it observed the `cancelling`
    /// signal at a safe point and is stopping.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::IllegalTransition`] if the job is not
    /// `cancelling`.
    pub fn observe_cancellation(
        mut self,
        now: DateTime<Utc>,
    ) -> Result<(Self, JobHistoryEntry), JobError> {
        self.require(JobStatus::Cancelling)?;
        self.status = JobStatus::Cancelled;
        Ok((
            self.clone(),
            JobHistoryEntry::new(&self, JobTransition::Cancelled, now, None),
        ))
    }

    fn require(&self, expected: JobStatus) -> Result<(), JobError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(JobError::IllegalTransition {
                job_id: self.id,
                from: self.status.label(),
                to: expected.label(),
            })
        }
    }
}

fn duration_since_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}

/// The kind of transition recorded in a [`JobHistoryEntry`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTransition {
    Started,
    Completed,
    FailedRetrying,
    FailedTerminal,
    CancelRequested,
    Cancelled,
}

/// An append-only record of one job state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryEntry {
    pub job_id: Uuid,
    pub transition: JobTransition,
    pub status_after: JobStatus,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

impl JobHistoryEntry {
    fn new(job: &Job, transition: JobTransition, executed_at: DateTime<Utc>, duration_ms: Option<i64>) -> Self {
        Self {
            job_id: job.id,
            transition,
            status_after: job.status,
            executed_at,
            duration_ms,
            error: job.error.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-28T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn new_job(max_retries: u32) -> Job {
        Job::enqueue(
            "refresh_tokens",
            json!({}),
            JobPriority::Normal,
            now(),
            now(),
            max_retries,
            None,
            None,
            json!({}),
            None,
        )
        .unwrap()
    }

    #[test]
    fn enqueue_rejects_empty_job_type() {
        let result = Job::enqueue(
            "",
            json!({}),
            JobPriority::Normal,
            now(),
            now(),
            3,
            None,
            None,
            json!({}),
            None,
        );
        assert!(matches!(result, Err(JobError::InvalidDefinition { .. })));
    }

    #[test]
    fn start_requires_pending() {
        let job = new_job(3);
        let (running, _) = job.start(now()).unwrap();
        assert!(matches!(running.start(now()), Err(JobError::IllegalTransition { .. })));
    }

    #[test]
    fn complete_from_running_succeeds() {
        let job = new_job(3);
        let (running, _) = job.start(now()).unwrap();
        let (done, history) = running.complete(json!({"ok": true}), now()).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(history.transition, JobTransition::Completed);
    }

    #[test]
    fn fail_retries_until_budget_exhausted_then_terminal() {
        let mut job = new_job(2);
        job = job.start(now()).unwrap().0;

        job = job.fail("boom", now()).unwrap().0;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.scheduled_at > now());

        job = job.start(now()).unwrap().0;
        job = job.fail("boom again", now()).unwrap().0;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 2);

        job = job.start(now()).unwrap().0;
        let (failed, history) = job.fail("final boom", now()).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(history.transition, JobTransition::FailedTerminal);
    }

    #[test]
    fn fail_six_history_rows_for_two_retries_then_terminal() {
        // Mirrors the documented scenario: enqueue, start, fail (retry),
        // start, fail (retry), start, fail (terminal) -> 6 transitions
        // after the initial enqueue, i.e. 6 history rows from `start`
        // onward (3 starts + 3 fails).
        let mut job = new_job(2);
        let mut history_rows = Vec::new();

        for _ in 0..3 {
            let (started, h1) = job.start(now()).unwrap();
            history_rows.push(h1);
            let (failed_job, h2) = started.fail("still broken", now()).unwrap();
            history_rows.push(h2);
            job = failed_job;
        }

        assert_eq!(history_rows.len(), 6);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn backoff_increases_scheduled_at_each_retry() {
        let job = new_job(5);
        let (running, _) = job.start(now()).unwrap();
        let (retried, _) = running
            .fail_with_backoff("err", now(), Duration::from_secs(30), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(retried.scheduled_at, now() + chrono::Duration::seconds(30));
    }

    #[test]
    fn cancel_pending_job_is_immediate() {
        let job = new_job(3);
        let (cancelled, history) = job.request_cancel(now()).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(history.transition, JobTransition::Cancelled);
    }

    #[test]
    fn cancel_running_job_is_cooperative() {
        let job = new_job(3);
        let (running, _) = job.start(now()).unwrap();
        let (cancelling, history) = running.request_cancel(now()).unwrap();
        assert_eq!(cancelling.status, JobStatus::Cancelling);
        assert_eq!(history.transition, JobTransition::CancelRequested);

        let (cancelled, _) = cancelling.observe_cancellation(now()).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[test]
    fn job_can_complete_despite_pending_cancel_request() {
        let job = new_job(3);
        let (running, _) = job.start(now()).unwrap();
        let (cancelling, _) = running.request_cancel(now()).unwrap();
        let (done, _) = cancelling.complete(json!({"done": true}), now()).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[test]
    fn cancel_terminal_job_is_rejected() {
        let job = new_job(3);
        let (running, _) = job.start(now()).unwrap();
        let (done, _) = running.complete(json!({}), now()).unwrap();
        assert!(matches!(
            done.request_cancel(now()),
            Err(JobError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn update_progress_requires_running_or_cancelling() {
        let job = new_job(3);
        let mut pending = job;
        assert!(pending.update_progress(0.5, None).is_err());

        let (mut running, _) = new_job(3).start(now()).unwrap();
        assert!(running.update_progress(1.5, Some("almost done".to_owned())).is_ok());
        assert_eq!(running.progress, Some(1.0));
    }
}
