//! Integration token lifecycle domain logic (C6/C7).
//!
//! Status derivation and refresh-transition rules are pure functions over
//! [`IntegrationToken`]. The `findExpiring` query itself (an ordered scan
//! over the `integration_tokens` table) is a `tenant-server` repository
//! concern; this module supplies the predicate it filters by, plus the
//! state transitions the `refresh_tokens` job handler applies to whatever
//! rows that query returns.

mod model;

pub use model::{
    DEFAULT_EXPIRING_BUFFER, IntegrationToken, StickyStatus, TokenStatus, derive_status,
    is_candidate_for_refresh, record_refresh_failure, record_refresh_success, record_revoked,
};
