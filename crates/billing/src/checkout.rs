//! Hosted checkout session creation.

use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CustomerId,
};
use uuid::Uuid;

use cove_shared::{BillingInterval, PlanTier};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Redirect target returned to the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

/// Checkout service: turns a plan intent into a provider-hosted session.
pub struct CheckoutService {
    stripe: StripeClient,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Create a subscription-mode checkout session for a paid plan.
    ///
    /// The org id is stamped into metadata on both the session and the
    /// subscription it creates; the webhook path correlates on it.
    pub async fn create_plan_checkout(
        &self,
        org_id: Uuid,
        customer_id: &str,
        tier: PlanTier,
        interval: BillingInterval,
    ) -> BillingResult<CheckoutResponse> {
        let price_id = self
            .stripe
            .config()
            .price_id_for(tier, interval)
            .ok_or_else(|| BillingError::InvalidTier(tier.to_string()))?
            .to_string();

        let customer: CustomerId = customer_id
            .parse()
            .map_err(|e| BillingError::Internal(format!("Invalid customer id: {}", e)))?;

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/settings/billing?checkout=success&session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/settings/billing?checkout=cancelled", base_url);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("plan".to_string(), tier.to_string());
        metadata.insert("interval".to_string(), interval.to_string());

        let params = CreateCheckoutSession {
            customer: Some(customer),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata.clone()),
            // Stamp the subscription too, so lifecycle events correlate
            // even when they arrive before our own record is written.
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(metadata),
                ..Default::default()
            }),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            org_id = %org_id,
            session_id = %session.id,
            plan = %tier,
            interval = %interval,
            price_id = %price_id,
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: session.id.to_string(),
            url: session.url.clone(),
        })
    }
}
