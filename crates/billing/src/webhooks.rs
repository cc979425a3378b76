//! Stripe webhook handling.
//!
//! Verifies inbound notifications, claims each provider event id exactly
//! once, distills the payload into a typed [`BillingEvent`], and applies
//! it through the reconciler inside a per-organization transaction.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{CheckoutSessionMode, Event, EventObject, EventType, Invoice, Subscription};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::client::StripeClient;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, BillingEventKind, ProviderSubscriptionState};
use crate::reconcile::{self, Reconciled, SideEffect};
use crate::store::SubscriptionStore;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamps older or newer than this are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in `processing` longer than this can be re-claimed
/// (crash recovery).
pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Webhook handler for Stripe events.
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    store: SubscriptionStore,
    catalog: PlanCatalog,
    email: BillingEmailService,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        let catalog = PlanCatalog::new(&stripe.config().price_ids);
        Self {
            stripe,
            pool,
            store,
            catalog,
            email,
        }
    }

    /// Verify a webhook signature and parse the payload.
    ///
    /// Nothing is mutated before this check passes.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        verify_signature(
            payload,
            signature,
            &self.stripe.config().webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Uses INSERT..ON CONFLICT..RETURNING to atomically claim exclusive
    /// processing rights for the event id, so a provider retry or two
    /// concurrent deliveries of the same event apply it exactly once.
    /// Events stuck in `processing` past the timeout can be re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events
                (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE billing_webhook_events.processing_result = 'processing'
              AND billing_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event, already claimed or processed"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event_type_str,
            event_id = %event_id,
            "Processing webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        // The audit record backs the idempotency claim; retry the update
        // once before giving up.
        let update = sqlx::query(
            "UPDATE billing_webhook_events SET processing_result = $1, error_message = $2 WHERE provider_event_id = $3",
        )
        .bind(&processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = update {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to update webhook event record failed, retrying"
            );
            if let Err(retry_err) = sqlx::query(
                "UPDATE billing_webhook_events SET processing_result = $1, error_message = $2 WHERE provider_event_id = $3",
            )
            .bind(&processing_result)
            .bind(&error_message)
            .bind(&event_id)
            .execute(&self.pool)
            .await
            {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type_str,
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to update webhook audit record after retry; event may appear stuck in 'processing'"
                );
            }
        }

        result
    }

    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let result = match event.type_ {
            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,

            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_synced(event).await
            }
            EventType::CustomerSubscriptionDeleted => self.handle_subscription_deleted(event).await,

            EventType::InvoicePaid => self.handle_invoice_paid(event).await,
            EventType::InvoicePaymentFailed => self.handle_invoice_payment_failed(event).await,

            _ => {
                // Forward-compatible no-op; logged so new event types that
                // may need handlers show up in the logs.
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled webhook event type, ignoring"
                );
                Ok(())
            }
        };

        // Correlation failures are terminal for the event: logged and
        // dropped, never guessed, never escalated into a retry loop.
        match result {
            Err(BillingError::MissingOrgCorrelation(detail)) => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.type_,
                    detail = %detail,
                    "Dropping webhook event without organization correlation"
                );
                Ok(())
            }
            other => other,
        }
    }

    async fn handle_checkout_completed(&self, event: &Event) -> BillingResult<()> {
        let session = match &event.data.object {
            EventObject::CheckoutSession(session) => session.clone(),
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        if session.mode != CheckoutSessionMode::Subscription {
            tracing::info!(
                session_id = %session.id,
                mode = ?session.mode,
                "Ignoring non-subscription checkout session"
            );
            return Ok(());
        }

        let org_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("org_id"))
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| {
                BillingError::MissingOrgCorrelation(format!(
                    "checkout session {} carries no org_id metadata",
                    session.id
                ))
            })?;

        let subscription_id = session
            .subscription
            .as_ref()
            .map(expandable_subscription_id)
            .ok_or_else(|| {
                BillingError::WebhookEventNotSupported(
                    "subscription-mode checkout session without a subscription".to_string(),
                )
            })?;

        // The session itself carries no price or period data; the
        // subscription object is authoritative for those.
        let sub_id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Internal(format!("Invalid subscription id: {}", e)))?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        let state = self.subscription_state(org_id, &subscription);
        let billing_event = billing_event(event, BillingEventKind::CheckoutCompleted(state));

        let reconciled = self.reconcile_and_store(org_id, &billing_event).await?;
        self.run_effects(org_id, &reconciled.effects).await;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            plan = %reconciled.record.plan,
            "Checkout completed"
        );

        Ok(())
    }

    async fn handle_subscription_synced(&self, event: &Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;
        let org_id = self.org_for_subscription(&subscription).await?;

        let state = self.subscription_state(org_id, &subscription);
        let billing_event = billing_event(event, BillingEventKind::SubscriptionSynced(state));

        let reconciled = self.reconcile_and_store(org_id, &billing_event).await?;
        self.run_effects(org_id, &reconciled.effects).await;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            status = %reconciled.record.status,
            plan = %reconciled.record.plan,
            "Subscription synced from provider"
        );

        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &Event) -> BillingResult<()> {
        let subscription = extract_subscription(event)?;
        let org_id = self.org_for_subscription(&subscription).await?;

        let billing_event = billing_event(event, BillingEventKind::SubscriptionDeleted);

        let reconciled = self.reconcile_and_store(org_id, &billing_event).await?;
        self.run_effects(org_id, &reconciled.effects).await;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.id,
            "Subscription deleted, organization back on free plan"
        );

        Ok(())
    }

    async fn handle_invoice_paid(&self, event: &Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;
        let org_id = self.org_for_invoice(&invoice).await?;

        let billing_event = billing_event(event, BillingEventKind::InvoicePaid);

        let reconciled = self.reconcile_and_store(org_id, &billing_event).await?;
        self.run_effects(org_id, &reconciled.effects).await;

        tracing::info!(
            org_id = %org_id,
            invoice_id = %invoice.id,
            amount = ?invoice.amount_paid,
            "Invoice paid"
        );

        Ok(())
    }

    async fn handle_invoice_payment_failed(&self, event: &Event) -> BillingResult<()> {
        let invoice = extract_invoice(event)?;
        let org_id = self.org_for_invoice(&invoice).await?;

        let error_message = invoice
            .last_finalization_error
            .as_ref()
            .and_then(|e| e.message.clone());

        let billing_event = billing_event(
            event,
            BillingEventKind::InvoicePaymentFailed { error_message },
        );

        let reconciled = self.reconcile_and_store(org_id, &billing_event).await?;
        self.run_effects(org_id, &reconciled.effects).await;

        tracing::warn!(
            org_id = %org_id,
            invoice_id = %invoice.id,
            amount = ?invoice.amount_due,
            failed_payment_count = reconciled.record.failed_payment_count,
            "Invoice payment failed"
        );

        Ok(())
    }

    /// Apply one billing event inside a per-organization transaction.
    ///
    /// The row lock taken by `get_for_update` serializes concurrent events
    /// for the same organization; the whole application commits or rolls
    /// back atomically, so a provider retry after a crash is safe.
    async fn reconcile_and_store(
        &self,
        org_id: Uuid,
        event: &BillingEvent,
    ) -> BillingResult<Reconciled> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.store.begin().await?;
        let current = self.store.get_for_update(&mut tx, org_id).await?;
        let reconciled = reconcile::apply(&self.catalog, org_id, current.as_ref(), event, now);
        self.store.upsert_in_tx(&mut tx, &reconciled.record).await?;
        tx.commit().await?;
        Ok(reconciled)
    }

    /// Run side effects after the record is committed. Failures here are
    /// logged, never escalated: the provider must not retry an event whose
    /// state change already landed.
    async fn run_effects(&self, org_id: Uuid, effects: &[SideEffect]) {
        for effect in effects {
            match effect {
                SideEffect::NotifyPaymentFailed {
                    failure_count,
                    grace_period_end,
                    error,
                } => {
                    if let Ok(Some((email, org_name))) = self.org_owner_email(org_id).await {
                        if let Err(e) = self
                            .email
                            .send_payment_failed(
                                &email,
                                &org_name,
                                *failure_count,
                                *grace_period_end,
                                error,
                            )
                            .await
                        {
                            tracing::error!(error = %e, "Failed to send payment failed email");
                        }
                    }
                }
                SideEffect::NotifyCanceled { access_until } => {
                    if let Ok(Some((email, org_name))) = self.org_owner_email(org_id).await {
                        if let Err(e) = self
                            .email
                            .send_subscription_canceled(&email, &org_name, *access_until)
                            .await
                        {
                            tracing::error!(error = %e, "Failed to send cancellation email");
                        }
                    }
                }
                SideEffect::ApplyPendingChange { plan, interval } => {
                    let subscriptions =
                        SubscriptionService::new(self.stripe.clone(), self.pool.clone());
                    match subscriptions
                        .apply_pending_change(org_id, *plan, *interval)
                        .await
                    {
                        Ok(()) => {
                            tracing::info!(
                                org_id = %org_id,
                                plan = %plan,
                                interval = %interval,
                                "Applied scheduled plan change at period renewal"
                            );
                        }
                        Err(e) => {
                            // The pending marker stays on the record, so the
                            // next renewal gets another chance.
                            tracing::error!(
                                org_id = %org_id,
                                plan = %plan,
                                error = %e,
                                "Failed to apply scheduled plan change"
                            );
                        }
                    }
                }
            }
        }
    }

    fn subscription_state(
        &self,
        org_id: Uuid,
        subscription: &Subscription,
    ) -> ProviderSubscriptionState {
        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|p| p.id.to_string());

        ProviderSubscriptionState {
            org_id,
            provider_customer_id: Some(expandable_customer_id(&subscription.customer)),
            provider_subscription_id: subscription.id.to_string(),
            price_id,
            provider_status: subscription.status.to_string(),
            current_period_start: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_start,
            )
            .ok(),
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .ok(),
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }

    /// Correlate a subscription event to an organization: the org_id we
    /// stamp into subscription metadata at checkout, falling back to the
    /// stored provider subscription id.
    async fn org_for_subscription(&self, subscription: &Subscription) -> BillingResult<Uuid> {
        if let Some(org_id) = subscription
            .metadata
            .get("org_id")
            .and_then(|id| Uuid::parse_str(id).ok())
        {
            return Ok(org_id);
        }

        let sub_id = subscription.id.to_string();
        if let Some(org_id) = self.store.org_for_provider_subscription(&sub_id).await? {
            return Ok(org_id);
        }

        Err(BillingError::MissingOrgCorrelation(format!(
            "subscription {} has no org_id metadata and no stored record",
            sub_id
        )))
    }

    /// Correlate an invoice to an organization through its subscription id,
    /// falling back to the customer id.
    async fn org_for_invoice(&self, invoice: &Invoice) -> BillingResult<Uuid> {
        if let Some(sub) = &invoice.subscription {
            let sub_id = expandable_subscription_id(sub);
            if let Some(org_id) = self.store.org_for_provider_subscription(&sub_id).await? {
                return Ok(org_id);
            }
        }

        if let Some(customer) = &invoice.customer {
            let customer_id = expandable_customer_id(customer);
            if let Some(org_id) = self.store.org_for_provider_customer(&customer_id).await? {
                return Ok(org_id);
            }
        }

        Err(BillingError::MissingOrgCorrelation(format!(
            "invoice {} matches no stored subscription or customer",
            invoice.id
        )))
    }

    /// Get the org owner's email and org name for notifications.
    async fn org_owner_email(&self, org_id: Uuid) -> BillingResult<Option<(String, String)>> {
        let result: Option<(Option<String>, String)> =
            sqlx::query_as("SELECT owner_email, name FROM organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.and_then(|(email, name)| email.map(|e| (e, name))))
    }
}

/// Check a `stripe-signature` header against a payload.
///
/// The header carries `t=<unix>,v1=<hex hmac>` pairs; the signed payload
/// is `"{t}.{body}"` keyed with the endpoint secret.
pub(crate) fn verify_signature(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance window"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret's "whsec_" prefix is not part of the key material.
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    // Constant-time comparison; a mismatch must not leak how far the
    // prefix matched.
    if computed.as_bytes().ct_eq(v1_signature.as_bytes()).unwrap_u8() != 1 {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

fn billing_event(event: &Event, kind: BillingEventKind) -> BillingEvent {
    let received_at = OffsetDateTime::from_unix_timestamp(event.created)
        .unwrap_or_else(|_| OffsetDateTime::now_utc());
    BillingEvent::new(event.id.to_string(), received_at, kind)
}

fn extract_subscription(event: &Event) -> BillingResult<Subscription> {
    match &event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

fn extract_invoice(event: &Event) -> BillingResult<Invoice> {
    match &event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice.clone()),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice".to_string(),
        )),
    }
}

fn expandable_customer_id(customer: &stripe::Expandable<stripe::Customer>) -> String {
    match customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    }
}

fn expandable_subscription_id(subscription: &stripe::Expandable<Subscription>) -> String {
    match subscription {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(s) => s.id.to_string(),
    }
}
