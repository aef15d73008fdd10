//! Pure cron tick logic: decide what happens to one [`CronEntry`] at `now`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::cron::model::CronEntry;
use crate::error::CronError;

/// Compute the next occurrence of `expression` strictly after `after`, in
/// the given timezone, converted back to UTC.
///
/// `expression` is the standard 5-field cron form (`minute hour
/// day-of-month month day-of-week`) per the wire-compatibility contract —
/// the `cron` crate's 6-field (seconds-first) grammar is an internal
/// implementation detail, so a literal `0` seconds field is prepended
/// before parsing.
///
/// Returns `Ok(None)` if the expression has no upcoming occurrence (the
/// `cron` crate's iterator is exhausted — practically unreachable for a
/// standard 5-field expression, but kept fallible so callers can skip the
/// entry quietly instead of panicking).
///
/// # Errors
///
/// Returns [`CronError::InvalidExpression`] if `expression` fails to parse.
pub fn compute_next_run_at(
    expression: &str,
    timezone: chrono_tz::Tz,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CronError> {
    let with_seconds = format!("0 {expression}");
    let schedule = Schedule::from_str(&with_seconds).map_err(|e| CronError::InvalidExpression {
        expression: expression.to_owned(),
        reason: e.to_string(),
    })?;

    let after_local = after.with_timezone(&timezone);
    Ok(schedule
        .after(&after_local)
        .next()
        .map(|next_local| next_local.with_timezone(&Utc)))
}

/// What happened to a single entry during one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not due yet, or inactive/paused — entry is returned unchanged.
    NotDue,
    /// Fired successfully; `next_run_at` was recomputed.
    Fired,
    /// Fired, but the enqueue call the caller supplied failed.
    FireFailed,
    /// The entry just crossed `max_failures` and was paused.
    Paused,
    /// The entry was due, but its expression has no upcoming occurrence in
    /// its own timezone (e.g. it was deactivated between due-check and
    /// recompute) — skipped without firing.
    SkippedNoUpcomingOccurrence,
}

/// Evaluate one entry at `now`.
///
/// `enqueue` is called only when the entry is due; it performs the actual
/// `type = entry.job_type, payload = entry.configuration` enqueue and
/// returns whether it succeeded. This function contains no I/O itself so
/// it can be unit tested with a fake `enqueue`.
///
/// # Errors
///
/// Returns [`CronError`] if the entry's cron expression cannot be parsed —
/// this should only happen if bad data reached the database, since entries
/// are validated on write.
pub fn tick(
    mut entry: CronEntry,
    now: DateTime<Utc>,
    enqueue: impl FnOnce(&CronEntry) -> bool,
) -> Result<(CronEntry, TickOutcome), CronError> {
    if !entry.is_due(now) {
        return Ok((entry, TickOutcome::NotDue));
    }

    let next = compute_next_run_at(&entry.cron_expression, entry.timezone, now)?;
    let Some(next_run_at) = next else {
        return Ok((entry, TickOutcome::SkippedNoUpcomingOccurrence));
    };

    let succeeded = enqueue(&entry);
    entry.last_run_at = Some(now);
    entry.next_run_at = next_run_at;

    if succeeded {
        entry.consecutive_failures = 0;
        Ok((entry, TickOutcome::Fired))
    } else {
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        if entry.consecutive_failures >= entry.max_failures {
            entry.is_paused = true;
            Ok((entry, TickOutcome::Paused))
        } else {
            Ok((entry, TickOutcome::FireFailed))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono_tz::UTC;
    use serde_json::json;
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-28T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn entry(next_run_at: DateTime<Utc>) -> CronEntry {
        CronEntry {
            id: Uuid::new_v4(),
            job_type: "refresh_tokens".to_owned(),
            configuration: json!({}),
            cron_expression: "*/30 * * * *".to_owned(),
            timezone: UTC,
            next_run_at,
            last_run_at: None,
            is_active: true,
            is_paused: false,
            consecutive_failures: 0,
            max_failures: 3,
        }
    }

    #[test]
    fn compute_next_run_at_advances_past_given_instant() {
        let next = compute_next_run_at("*/30 * * * *", UTC, now())
            .unwrap()
            .unwrap();
        assert!(next > now());
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let result = compute_next_run_at("not a cron expression", UTC, now());
        assert!(matches!(result, Err(CronError::InvalidExpression { .. })));
    }

    #[test]
    fn not_due_entry_is_untouched() {
        let e = entry(now() + chrono::Duration::hours(1));
        let (after, outcome) = tick(e.clone(), now(), |_| true).unwrap();
        assert_eq!(outcome, TickOutcome::NotDue);
        assert_eq!(after.next_run_at, e.next_run_at);
    }

    #[test]
    fn due_entry_fires_and_recomputes_next_run() {
        let e = entry(now());
        let (after, outcome) = tick(e, now(), |_| true).unwrap();
        assert_eq!(outcome, TickOutcome::Fired);
        assert_eq!(after.last_run_at, Some(now()));
        assert!(after.next_run_at > now());
        assert_eq!(after.consecutive_failures, 0);
    }

    #[test]
    fn paused_entry_is_not_due() {
        let mut e = entry(now());
        e.is_paused = true;
        let (_, outcome) = tick(e, now(), |_| true).unwrap();
        assert_eq!(outcome, TickOutcome::NotDue);
    }

    #[test]
    fn failed_enqueue_increments_failures_without_pausing_below_threshold() {
        let e = entry(now());
        let (after, outcome) = tick(e, now(), |_| false).unwrap();
        assert_eq!(outcome, TickOutcome::FireFailed);
        assert_eq!(after.consecutive_failures, 1);
        assert!(!after.is_paused);
    }

    #[test]
    fn repeated_enqueue_failures_pause_the_entry() {
        let mut e = entry(now());
        e.consecutive_failures = 2;
        e.max_failures = 3;
        let (after, outcome) = tick(e, now(), |_| false).unwrap();
        assert_eq!(outcome, TickOutcome::Paused);
        assert!(after.is_paused);
        assert_eq!(after.consecutive_failures, 3);
    }
}
