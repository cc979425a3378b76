//! Subscription management: scheduled plan changes, undo, cancellation.
//!
//! Upgrades always go through the hosted checkout flow (payment up front);
//! downgrades and interval switches are scheduled here and take effect at
//! the end of the current billing period. The reconciler trusts whatever
//! the provider later reports, so every mutation made here is eventually
//! confirmed (or corrected) by a webhook.

use sqlx::PgPool;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{CancelSubscription, Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems};
use time::OffsetDateTime;
use uuid::Uuid;

use cove_shared::{BillingInterval, PlanTier};

use crate::catalog::{PlanCatalog, PlanChange};
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::SubscriptionRecord;
use crate::store::SubscriptionStore;

/// Information about a scheduled plan change.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledChange {
    pub current_plan: PlanTier,
    pub new_plan: PlanTier,
    pub new_interval: BillingInterval,
    /// End of the current paid period; when the change takes effect.
    pub effective_at: Option<OffsetDateTime>,
}

/// Result of an undo request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UndoResult {
    /// False when there was nothing pending (idempotent success).
    pub cleared: bool,
}

/// Subscription service for plan-change orchestration.
pub struct SubscriptionService {
    stripe: StripeClient,
    store: SubscriptionStore,
    catalog: PlanCatalog,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let store = SubscriptionStore::new(pool);
        let catalog = PlanCatalog::new(&stripe.config().price_ids);
        Self {
            stripe,
            store,
            catalog,
        }
    }

    /// The record for an organization, or the implicit free record when
    /// none has been persisted yet.
    pub async fn get_record(&self, org_id: Uuid) -> BillingResult<SubscriptionRecord> {
        Ok(self
            .store
            .get(org_id)
            .await?
            .unwrap_or_else(|| SubscriptionRecord::implicit_free(org_id)))
    }

    /// Schedule a downgrade or interval switch to take effect at period
    /// end. The user keeps the current plan until then.
    ///
    /// Upgrades are rejected: they take effect immediately and must go
    /// through checkout so payment is collected first.
    pub async fn schedule_plan_change(
        &self,
        org_id: Uuid,
        target: PlanTier,
        target_interval: BillingInterval,
    ) -> BillingResult<ScheduledChange> {
        let record = self
            .store
            .get(org_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(org_id))?;

        let subscription_id = record
            .provider_subscription_id
            .clone()
            .ok_or(BillingError::SubscriptionNotFound(org_id))?;

        if !record.status.keeps_pending_change() {
            return Err(BillingError::InvalidInput(format!(
                "subscription is {}; plan changes require an active subscription",
                record.status
            )));
        }

        match self
            .catalog
            .classify_change(record.plan, record.interval, target, target_interval)
        {
            PlanChange::Upgrade => {
                return Err(BillingError::UseCheckoutFlow(format!(
                    "Changing from {} to {} is an upgrade; use the checkout flow",
                    record.plan, target
                )));
            }
            PlanChange::NoChange => {
                return Err(BillingError::InvalidInput(format!(
                    "organization is already on the {} plan",
                    target
                )));
            }
            PlanChange::Downgrade | PlanChange::SwitchInterval => {}
        }

        let mut updated = record.clone();

        if target == PlanTier::Free {
            // A downgrade to free is a non-renewal: flip the provider flag
            // so the subscription ends at period end. The confirming
            // subscription-updated webhook re-derives the record.
            let sub_id = parse_subscription_id(&subscription_id)?;
            let params = UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            Subscription::update(self.stripe.inner(), &sub_id, params).await?;

            updated.cancel_at_period_end = true;
            updated.pending_plan = None;
            updated.pending_interval = None;
        } else {
            // Paid-to-paid changes are applied at the next renewal, keyed
            // off the invoice-paid event for the new period.
            updated.pending_plan = Some(target);
            updated.pending_interval = Some(target_interval);
        }

        self.store.upsert(&updated).await?;

        tracing::info!(
            org_id = %org_id,
            current_plan = %record.plan,
            new_plan = %target,
            new_interval = %target_interval,
            effective_at = ?record.current_period_end,
            "Scheduled plan change for period end"
        );

        Ok(ScheduledChange {
            current_plan: record.plan,
            new_plan: target,
            new_interval: target_interval,
            effective_at: record.current_period_end,
        })
    }

    /// Clear any scheduled change, locally and at the provider.
    ///
    /// Idempotent: undoing when nothing is pending succeeds and leaves the
    /// record untouched.
    pub async fn undo_scheduled_change(&self, org_id: Uuid) -> BillingResult<UndoResult> {
        let Some(record) = self.store.get(org_id).await? else {
            return Ok(UndoResult { cleared: false });
        };

        if !record.has_pending_change() {
            return Ok(UndoResult { cleared: false });
        }

        if record.cancel_at_period_end {
            if let Some(subscription_id) = &record.provider_subscription_id {
                let sub_id = parse_subscription_id(subscription_id)?;
                let params = UpdateSubscription {
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                };
                Subscription::update(self.stripe.inner(), &sub_id, params).await?;
            }
        }

        let mut updated = record;
        updated.cancel_at_period_end = false;
        updated.pending_plan = None;
        updated.pending_interval = None;
        self.store.upsert(&updated).await?;

        tracing::info!(org_id = %org_id, "Cleared scheduled plan change");

        Ok(UndoResult { cleared: true })
    }

    /// Apply a pending plan change at period renewal by mutating the
    /// provider subscription to the pending price.
    ///
    /// Proration is disabled: the new period is billed at the new price
    /// and nothing from the old period is owed. The provider's confirming
    /// subscription-updated event clears the pending marker.
    pub async fn apply_pending_change(
        &self,
        org_id: Uuid,
        plan: PlanTier,
        interval: BillingInterval,
    ) -> BillingResult<()> {
        let record = self
            .store
            .get(org_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(org_id))?;

        let subscription_id = record
            .provider_subscription_id
            .ok_or(BillingError::SubscriptionNotFound(org_id))?;
        let sub_id = parse_subscription_id(&subscription_id)?;

        if plan == PlanTier::Free {
            // Scheduled free downgrades normally ride cancel_at_period_end;
            // if one surfaces here, end the subscription outright.
            let params = CancelSubscription {
                cancellation_details: None,
                invoice_now: None,
                prorate: None,
            };
            Subscription::cancel(self.stripe.inner(), &sub_id, params).await?;
            return Ok(());
        }

        let price_id = self
            .stripe
            .config()
            .price_id_for(plan, interval)
            .ok_or_else(|| BillingError::InvalidTier(plan.to_string()))?
            .to_string();

        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = subscription
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "subscription {} has no items to update",
                    subscription_id
                ))
            })?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("plan".to_string(), plan.to_string());

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            proration_behavior: Some(SubscriptionProrationBehavior::None),
            ..Default::default()
        };
        Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        Ok(())
    }
}

fn parse_subscription_id(raw: &str) -> BillingResult<SubscriptionId> {
    raw.parse::<SubscriptionId>()
        .map_err(|e| BillingError::Internal(format!("Invalid subscription id {}: {}", raw, e)))
}
