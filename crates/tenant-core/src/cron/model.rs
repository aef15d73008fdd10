//! Cron entry data model.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A scheduled recurring job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntry {
    pub id: Uuid,
    pub job_type: String,
    pub configuration: serde_json::Value,
    pub cron_expression: String,
    pub timezone: Tz,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_paused: bool,
    pub consecutive_failures: u32,
    pub max_failures: u32,
}

impl CronEntry {
    /// Whether this entry is due to fire at `now` — active, not paused,
    /// and its `next_run_at` has arrived.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_paused && self.next_run_at <= now
    }
}
