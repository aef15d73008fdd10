//! Cron scheduling domain logic (C9).
//!
//! Computes `next_run_at` from a cron expression and IANA timezone, and
//! decides what a scheduler tick should do with one entry. Leader election
//! (`pg_try_advisory_lock`), persistence, and the actual job-enqueue call
//! live in `tenant-server`.

mod model;
mod scheduler;

pub use model::CronEntry;
pub use scheduler::{TickOutcome, compute_next_run_at, tick};
