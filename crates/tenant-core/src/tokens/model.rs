//! Integration token data model and status derivation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The sticky half of a token's status: set by an explicit signal and not
/// overridden by time-based derivation until cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyStatus {
    /// An external signal (the provider, or an operator) revoked the grant.
    Revoked,
    /// The refresh budget (`consecutive_failures >= max_failures`) was
    /// exhausted.
    RefreshFailed,
}

/// A token's fully derived status, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Expiring,
    Expired,
    Revoked,
    RefreshFailed,
}

/// An OAuth integration token, keyed by `(store_id, integration_type,
/// config_key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationToken {
    pub id: Uuid,
    pub store_id: Uuid,
    pub integration_type: String,
    pub config_key: String,
    /// The vault-wrapped access token credential, opaque to this module.
    pub access_token_blob: String,
    /// The vault-wrapped refresh token credential, if the provider issues
    /// long-lived refresh tokens.
    pub refresh_token_blob: Option<String>,
    pub token_expires_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub max_failures: u32,
    pub sticky_status: Option<StickyStatus>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

/// Default lookahead window for "about to expire": 60 minutes.
pub const DEFAULT_EXPIRING_BUFFER: ChronoDuration = ChronoDuration::minutes(60);

/// Derive a token's reported status at `now`.
///
/// Sticky statuses (`revoked`, `refresh_failed`) always win. Otherwise the
/// status is computed from `token_expires_at` relative to `now` and
/// `buffer`: `expired` if already past expiry, `expiring` if within
/// `buffer` of expiry, `active` otherwise.
#[must_use]
pub fn derive_status(token: &IntegrationToken, now: DateTime<Utc>, buffer: ChronoDuration) -> TokenStatus {
    match token.sticky_status {
        Some(StickyStatus::Revoked) => return TokenStatus::Revoked,
        Some(StickyStatus::RefreshFailed) => return TokenStatus::RefreshFailed,
        None => {}
    }

    if now >= token.token_expires_at {
        TokenStatus::Expired
    } else if now >= token.token_expires_at - buffer {
        TokenStatus::Expiring
    } else {
        TokenStatus::Active
    }
}

/// The `findExpiring(buffer)` predicate: is this token a candidate for the
/// refresh scheduler at `now`?
///
/// True when the derived status is `active` or `expiring`,
/// `token_expires_at <= now + buffer`, and the token hasn't exhausted its
/// failure budget. Sticky `revoked`/`refresh_failed` tokens are always
/// excluded.
#[must_use]
pub fn is_candidate_for_refresh(token: &IntegrationToken, now: DateTime<Utc>, buffer: ChronoDuration) -> bool {
    let status = derive_status(token, now, buffer);
    matches!(status, TokenStatus::Active | TokenStatus::Expiring)
        && token.token_expires_at <= now + buffer
        && token.consecutive_failures < token.max_failures
}

/// Apply a successful refresh: clear the failure counter and advance
/// expiry. Does not touch `sticky_status` — a token cannot be refreshed in
/// the first place once `revoked`, since [`is_candidate_for_refresh`]
/// excludes it.
pub fn record_refresh_success(token: &mut IntegrationToken, new_expires_at: DateTime<Utc>, now: DateTime<Utc>) {
    token.token_expires_at = new_expires_at;
    token.consecutive_failures = 0;
    token.last_refreshed_at = Some(now);
}

/// Apply a failed refresh attempt. Sets the sticky `refresh_failed` status
/// once `consecutive_failures` reaches `max_failures`.
pub fn record_refresh_failure(token: &mut IntegrationToken) {
    token.consecutive_failures = token.consecutive_failures.saturating_add(1);
    if token.consecutive_failures >= token.max_failures {
        token.sticky_status = Some(StickyStatus::RefreshFailed);
    }
}

/// Apply an external revocation signal. Sticky until explicitly cleared by
/// an operator (outside the scope of automatic status derivation).
pub fn record_revoked(token: &mut IntegrationToken) {
    token.sticky_status = Some(StickyStatus::Revoked);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_expiring_at(expires_at: DateTime<Utc>) -> IntegrationToken {
        IntegrationToken {
            id: Uuid::new_v4(),
            store_id: Uuid::new_v4(),
            integration_type: "shopify".to_owned(),
            config_key: "default".to_owned(),
            access_token_blob: "blob".to_owned(),
            refresh_token_blob: None,
            token_expires_at: expires_at,
            consecutive_failures: 0,
            max_failures: 5,
            sticky_status: None,
            last_refreshed_at: None,
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-28T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn active_when_far_from_expiry() {
        let token = token_expiring_at(now() + ChronoDuration::hours(5));
        assert_eq!(
            derive_status(&token, now(), DEFAULT_EXPIRING_BUFFER),
            TokenStatus::Active
        );
    }

    #[test]
    fn expiring_within_buffer() {
        let token = token_expiring_at(now() + ChronoDuration::minutes(30));
        assert_eq!(
            derive_status(&token, now(), DEFAULT_EXPIRING_BUFFER),
            TokenStatus::Expiring
        );
    }

    #[test]
    fn expiring_at_exact_buffer_boundary() {
        let token = token_expiring_at(now() + DEFAULT_EXPIRING_BUFFER);
        assert_eq!(
            derive_status(&token, now(), DEFAULT_EXPIRING_BUFFER),
            TokenStatus::Expiring
        );
    }

    #[test]
    fn expired_when_past_expiry() {
        let token = token_expiring_at(now() - ChronoDuration::seconds(1));
        assert_eq!(
            derive_status(&token, now(), DEFAULT_EXPIRING_BUFFER),
            TokenStatus::Expired
        );
    }

    #[test]
    fn sticky_revoked_overrides_time_derivation() {
        let mut token = token_expiring_at(now() + ChronoDuration::hours(5));
        token.sticky_status = Some(StickyStatus::Revoked);
        assert_eq!(
            derive_status(&token, now(), DEFAULT_EXPIRING_BUFFER),
            TokenStatus::Revoked
        );
    }

    #[test]
    fn candidate_for_refresh_excludes_revoked() {
        let mut token = token_expiring_at(now() + ChronoDuration::minutes(10));
        token.sticky_status = Some(StickyStatus::Revoked);
        assert!(!is_candidate_for_refresh(&token, now(), DEFAULT_EXPIRING_BUFFER));
    }

    #[test]
    fn candidate_for_refresh_excludes_exhausted_failure_budget() {
        let mut token = token_expiring_at(now() + ChronoDuration::minutes(10));
        token.consecutive_failures = 5;
        token.max_failures = 5;
        assert!(!is_candidate_for_refresh(&token, now(), DEFAULT_EXPIRING_BUFFER));
    }

    #[test]
    fn candidate_for_refresh_includes_expiring_token_under_budget() {
        let token = token_expiring_at(now() + ChronoDuration::minutes(10));
        assert!(is_candidate_for_refresh(&token, now(), DEFAULT_EXPIRING_BUFFER));
    }

    #[test]
    fn refresh_success_clears_failures_and_advances_expiry() {
        let mut token = token_expiring_at(now());
        token.consecutive_failures = 3;
        let new_expiry = now() + ChronoDuration::hours(2);
        record_refresh_success(&mut token, new_expiry, now());
        assert_eq!(token.consecutive_failures, 0);
        assert_eq!(token.token_expires_at, new_expiry);
        assert_eq!(token.last_refreshed_at, Some(now()));
    }

    #[test]
    fn refresh_failure_sets_sticky_status_at_threshold() {
        let mut token = token_expiring_at(now());
        token.max_failures = 2;
        token.consecutive_failures = 1;
        record_refresh_failure(&mut token);
        assert_eq!(token.consecutive_failures, 2);
        assert_eq!(token.sticky_status, Some(StickyStatus::RefreshFailed));
    }

    #[test]
    fn refresh_failure_below_threshold_stays_non_sticky() {
        let mut token = token_expiring_at(now());
        token.max_failures = 5;
        record_refresh_failure(&mut token);
        assert_eq!(token.consecutive_failures, 1);
        assert_eq!(token.sticky_status, None);
    }

    #[test]
    fn revoke_sets_sticky_status() {
        let mut token = token_expiring_at(now());
        record_revoked(&mut token);
        assert_eq!(token.sticky_status, Some(StickyStatus::Revoked));
    }
}
