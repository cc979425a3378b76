//! Grace-period / dunning policy.
//!
//! The reconciler sets and clears the grace deadline; whether access is
//! currently restricted is a question for feature-gating callers, answered
//! here without touching storage.

use time::{Duration, OffsetDateTime};

use crate::reconcile::SubscriptionRecord;

/// How long an organization keeps access after a failed payment.
pub const GRACE_PERIOD: Duration = Duration::days(10);

/// Deadline written on each failed payment. Repeated failures advance the
/// deadline to the most recent failure plus the grace period.
pub fn grace_deadline(now: OffsetDateTime) -> OffsetDateTime {
    now + GRACE_PERIOD
}

/// True iff the record's grace deadline exists and has passed.
pub fn is_access_restricted(record: &SubscriptionRecord, now: OffsetDateTime) -> bool {
    match record.grace_period_end {
        Some(end) => now >= end,
        None => false,
    }
}
