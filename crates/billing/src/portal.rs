//! Self-service billing portal sessions.

use stripe::{BillingPortalSession, CreateBillingPortalSession, CustomerId};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Redirect target for the provider-hosted management portal.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PortalResponse {
    pub portal_url: String,
}

pub struct PortalService {
    stripe: StripeClient,
}

impl PortalService {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    /// Create a portal session for an organization's billing customer.
    ///
    /// Callers must resolve the customer id first; an organization that
    /// never checked out has none, and that is a "no subscription" error
    /// surfaced to the user, not something to paper over.
    pub async fn create_portal_session(
        &self,
        org_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<PortalResponse> {
        let customer: CustomerId = customer_id
            .parse()
            .map_err(|e| BillingError::Internal(format!("Invalid customer id: {}", e)))?;

        let return_url = format!("{}/settings/billing", self.stripe.config().app_base_url);

        let mut params = CreateBillingPortalSession::new(customer);
        params.return_url = Some(&return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            org_id = %org_id,
            "Created billing portal session"
        );

        Ok(PortalResponse {
            portal_url: session.url,
        })
    }
}
