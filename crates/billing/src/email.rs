//! Billing e-mail notifications.
//!
//! Sent through the Resend HTTP API. The service is disabled (warn once at
//! startup, then no-op) when no API key is configured, so self-hosted
//! deployments work without an e-mail provider.

use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// E-mail sender for billing lifecycle notifications.
#[derive(Clone)]
pub struct BillingEmailService {
    client: reqwest::Client,
    api_key: Option<String>,
    from: String,
}

impl BillingEmailService {
    pub fn from_env() -> Self {
        let api_key = std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!("Billing e-mail notifications not configured (missing RESEND_API_KEY)");
        }

        Self {
            client: reqwest::Client::new(),
            api_key,
            from: std::env::var("BILLING_EMAIL_FROM")
                .unwrap_or_else(|_| "Cove Billing <billing@cove.team>".to_string()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// A payment failed; tell the owner when access ends.
    pub async fn send_payment_failed(
        &self,
        to: &str,
        org_name: &str,
        failure_count: i32,
        grace_period_end: OffsetDateTime,
        error: &str,
    ) -> BillingResult<()> {
        let deadline = grace_period_end.date();
        let subject = if failure_count <= 1 {
            format!("Payment failed for {}", org_name)
        } else {
            format!(
                "Payment failed again for {} (attempt {})",
                org_name, failure_count
            )
        };
        let html = format!(
            "<p>We could not collect payment for <strong>{}</strong> ({}).</p>\
             <p>Please update your payment method before <strong>{}</strong> to keep access \
             to your paid plan. You can manage billing from your workspace settings.</p>",
            org_name, error, deadline
        );
        self.send(to, &subject, &html).await
    }

    /// The subscription ended; confirm the downgrade to the free plan.
    pub async fn send_subscription_canceled(
        &self,
        to: &str,
        org_name: &str,
        access_until: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let until = access_until
            .map(|t| t.date().to_string())
            .unwrap_or_else(|| "now".to_string());
        let subject = format!("Subscription cancelled for {}", org_name);
        let html = format!(
            "<p>The paid subscription for <strong>{}</strong> has been cancelled.</p>\
             <p>Paid features remain available until {}. You can resubscribe any time from \
             your workspace settings.</p>",
            org_name, until
        );
        self.send(to, &subject, &html).await
    }

    /// A downgrade or interval switch was scheduled for period end.
    pub async fn send_change_scheduled(
        &self,
        to: &str,
        org_name: &str,
        new_plan: &str,
        effective_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let effective = effective_at
            .map(|t| t.date().to_string())
            .unwrap_or_else(|| "the end of the current billing period".to_string());
        let subject = format!("Plan change scheduled for {}", org_name);
        let html = format!(
            "<p>Your plan change for <strong>{}</strong> to <strong>{}</strong> is scheduled \
             for {}.</p><p>You keep your current plan until then, and you can undo the change \
             from your workspace settings at any time before it takes effect.</p>",
            org_name, new_plan, effective
        );
        self.send(to, &subject, &html).await
    }

    async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let Some(api_key) = &self.api_key else {
            tracing::debug!(to = %to, subject = %subject, "E-mail disabled, skipping send");
            return Ok(());
        };

        let body = serde_json::json!({
            "from": self.from,
            "to": [to],
            "subject": subject,
            "html": html,
        });

        self.client
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("email send failed: {}", e)))?
            .error_for_status()
            .map_err(|e| BillingError::Internal(format!("email send rejected: {}", e)))?;

        tracing::info!(to = %to, subject = %subject, "Sent billing e-mail");
        Ok(())
    }
}
