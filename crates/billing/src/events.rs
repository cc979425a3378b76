//! Typed billing event envelope.
//!
//! The webhook handler verifies and parses a raw provider notification,
//! then distills it into a [`BillingEvent`] before handing it to the
//! reconciler. The reconciler never sees provider SDK types; everything it
//! needs is carried here, which keeps the transition function pure and
//! testable without a network.

use time::OffsetDateTime;
use uuid::Uuid;

/// Snapshot of a provider subscription object, as carried by checkout and
/// subscription lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscriptionState {
    pub org_id: Uuid,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: String,
    /// Price id of the subscription's primary item; resolved to a plan
    /// through the catalog. `None` when the provider sent no items.
    pub price_id: Option<String>,
    /// Raw provider status string; mapped through the canonical table.
    pub provider_status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// The event kinds the reconciler understands.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEventKind {
    /// Hosted checkout finished for a subscription-mode session.
    CheckoutCompleted(ProviderSubscriptionState),
    /// The provider created or updated a subscription. Authoritative for
    /// plan, interval, period bounds, and `cancel_at_period_end`.
    SubscriptionSynced(ProviderSubscriptionState),
    /// The subscription ended at the provider. Terminal for that
    /// subscription id.
    SubscriptionDeleted,
    /// An invoice was paid; clears dunning state.
    InvoicePaid,
    /// An invoice payment failed; advances dunning state.
    InvoicePaymentFailed {
        error_message: Option<String>,
    },
}

/// A verified, correlated event ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingEvent {
    /// Provider event id; deduplication key for duplicate deliveries.
    pub event_id: String,
    pub received_at: OffsetDateTime,
    pub kind: BillingEventKind,
}

impl BillingEvent {
    pub fn new(event_id: impl Into<String>, received_at: OffsetDateTime, kind: BillingEventKind) -> Self {
        Self {
            event_id: event_id.into(),
            received_at,
            kind,
        }
    }
}
