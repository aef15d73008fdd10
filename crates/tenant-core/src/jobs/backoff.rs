//! Exponential backoff for job retries.

use std::time::Duration;

/// Default base delay before the first retry: 30 seconds.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Default cap on retry delay: 1 hour.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(3600);

/// Compute the retry delay for the `n`th retry attempt (1-indexed).
///
/// `backoff(n) = min(cap, base * 2^(n-1))`. `n` is clamped to avoid
/// overflowing the `2^(n-1)` shift for pathologically large retry counts —
/// the result saturates at `cap` well before that point in practice.
#[must_use]
pub fn backoff(n: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = n.saturating_sub(1).min(63);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let scaled = base.as_millis().min(u128::from(u64::MAX)) as u64;
    let delay_ms = scaled.saturating_mul(factor);
    Duration::from_millis(delay_ms).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_is_base_delay() {
        assert_eq!(
            backoff(1, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn doubles_each_attempt() {
        assert_eq!(
            backoff(2, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            Duration::from_secs(60)
        );
        assert_eq!(
            backoff(3, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            Duration::from_secs(120)
        );
        assert_eq!(
            backoff(4, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            Duration::from_secs(240)
        );
    }

    #[test]
    fn caps_at_configured_maximum() {
        assert_eq!(
            backoff(20, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            DEFAULT_BACKOFF_CAP
        );
    }

    #[test]
    fn does_not_overflow_for_large_attempt_counts() {
        let delay = backoff(u32::MAX, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP);
        assert_eq!(delay, DEFAULT_BACKOFF_CAP);
    }

    #[test]
    fn zero_is_treated_like_first_attempt() {
        assert_eq!(
            backoff(0, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP),
            backoff(1, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP)
        );
    }
}
