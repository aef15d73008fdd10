//! Durable background job engine domain logic (C8).
//!
//! This module owns the job state machine and retry-backoff math only.
//! Persistence (the `jobs`/`job_history` tables, `SELECT ... FOR UPDATE
//! SKIP LOCKED` leasing, dedupe-key enforcement) lives in `tenant-server`,
//! which is the only crate that depends on `sqlx`. Keeping the transition
//! rules here means they can be unit tested without a database and reused
//! by both the HTTP-facing enqueue path and the CLI's admin commands.

mod backoff;
mod model;

pub use backoff::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, backoff};
pub use model::{Job, JobHistoryEntry, JobPriority, JobStatus, JobTransition};
