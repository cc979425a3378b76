//! Billing error types.

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the billing crate.
///
/// The webhook endpoint maps these onto HTTP statuses: signature failures
/// become 400, correlation failures are logged and dropped (200 so the
/// provider stops retrying), database failures become 500 so the provider
/// retries the whole event.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// The webhook signature header was missing, malformed, stale, or did
    /// not match the payload.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// The event payload did not carry the object we expected for its type.
    #[error("webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    /// The event could not be tied back to an organization. Non-retryable:
    /// the handler logs and drops these rather than guessing.
    #[error("event carries no organization reference: {0}")]
    MissingOrgCorrelation(String),

    #[error("invalid plan tier: {0}")]
    InvalidTier(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The requested change must go through the hosted checkout flow.
    #[error("{0}")]
    UseCheckoutFlow(String),

    /// The organization has no billing customer at the provider yet.
    #[error("no billing customer exists for organization {0}")]
    NoCustomer(Uuid),

    #[error("no subscription found for organization {0}")]
    SubscriptionNotFound(Uuid),

    #[error("billing configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("stripe API error: {0}")]
    StripeApi(String),

    #[error("internal billing error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}
