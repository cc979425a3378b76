//! Subscription reconciliation.
//!
//! [`apply`] is the transition function at the heart of the billing core:
//! given the persisted record (if any) and one verified event, it produces
//! the next record plus the side effects the caller should run. It touches
//! no storage and makes no network calls; the webhook handler wraps it in
//! a per-organization transaction and executes the effects afterwards.

use cove_shared::{BillingInterval, PlanTier, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::events::{BillingEvent, BillingEventKind, ProviderSubscriptionState};
use crate::policy;

/// Persisted subscription state for one organization.
///
/// Absence of a row is equivalent to [`SubscriptionRecord::implicit_free`].
/// Records are never deleted; cancellation is a state.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SubscriptionRecord {
    pub org_id: Uuid,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub plan: PlanTier,
    pub interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub pending_plan: Option<PlanTier>,
    pub pending_interval: Option<BillingInterval>,
    pub failed_payment_count: i32,
    pub grace_period_end: Option<OffsetDateTime>,
    pub last_payment_error: Option<String>,
}

impl SubscriptionRecord {
    /// The record an organization implicitly has before its first checkout.
    pub fn implicit_free(org_id: Uuid) -> Self {
        Self {
            org_id,
            provider_customer_id: None,
            provider_subscription_id: None,
            plan: PlanTier::Free,
            interval: BillingInterval::Monthly,
            status: SubscriptionStatus::Active,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            pending_plan: None,
            pending_interval: None,
            failed_payment_count: 0,
            grace_period_end: None,
            last_payment_error: None,
        }
    }

    pub fn has_pending_change(&self) -> bool {
        self.pending_plan.is_some() || self.cancel_at_period_end
    }
}

/// Side effects the caller must run after persisting the new record.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Tell the organization owner a payment failed and when access ends.
    NotifyPaymentFailed {
        failure_count: i32,
        grace_period_end: OffsetDateTime,
        error: String,
    },
    /// Confirm the subscription ended.
    NotifyCanceled {
        access_until: Option<OffsetDateTime>,
    },
    /// A new billing period started and a scheduled plan change is due:
    /// mutate the provider subscription to the pending price. The
    /// provider's confirming subscription-updated event re-derives the
    /// final state.
    ApplyPendingChange {
        plan: PlanTier,
        interval: BillingInterval,
    },
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub record: SubscriptionRecord,
    pub effects: Vec<SideEffect>,
}

impl Reconciled {
    fn record_only(record: SubscriptionRecord) -> Self {
        Self {
            record,
            effects: Vec::new(),
        }
    }
}

/// Apply one event to the current record.
///
/// `org_id` is the correlation result established by the caller; for
/// checkout and subscription events it must match the id carried in the
/// event payload.
pub fn apply(
    catalog: &PlanCatalog,
    org_id: Uuid,
    current: Option<&SubscriptionRecord>,
    event: &BillingEvent,
    now: OffsetDateTime,
) -> Reconciled {
    let out = match &event.kind {
        BillingEventKind::CheckoutCompleted(state) => {
            debug_assert_eq!(org_id, state.org_id);
            apply_checkout_completed(catalog, org_id, state)
        }
        BillingEventKind::SubscriptionSynced(state) => {
            debug_assert_eq!(org_id, state.org_id);
            apply_subscription_synced(catalog, org_id, current, state)
        }
        BillingEventKind::SubscriptionDeleted => apply_subscription_deleted(org_id, current),
        BillingEventKind::InvoicePaid => apply_invoice_paid(org_id, current),
        BillingEventKind::InvoicePaymentFailed { error_message } => {
            apply_invoice_payment_failed(org_id, current, error_message.as_deref(), now)
        }
    };

    debug_assert!(invariants_hold(&out.record), "reconciler produced an invalid record");
    out
}

/// Resolve a price id through the catalog, falling back to the free plan
/// for anything unrecognized.
fn resolve_plan(catalog: &PlanCatalog, price_id: Option<&str>) -> (PlanTier, BillingInterval) {
    match price_id.and_then(|id| catalog.plan_for_price_id(id)) {
        Some(resolved) => resolved,
        None => {
            if let Some(id) = price_id {
                tracing::warn!(price_id = %id, "Unrecognized provider price id, resolving to free plan");
            }
            (PlanTier::Free, BillingInterval::Monthly)
        }
    }
}

fn apply_checkout_completed(
    catalog: &PlanCatalog,
    org_id: Uuid,
    state: &ProviderSubscriptionState,
) -> Reconciled {
    let (plan, interval) = resolve_plan(catalog, state.price_id.as_deref());
    let status = SubscriptionStatus::from_provider(&state.provider_status);

    // A checkout whose subscription is already terminal (e.g. the session
    // expired as incomplete) lands directly on the canceled free record.
    let plan = if status == SubscriptionStatus::Canceled {
        PlanTier::Free
    } else {
        plan
    };

    // Checkout replaces whatever was there: a brand-new subscription has no
    // dunning history and no scheduled change.
    Reconciled::record_only(SubscriptionRecord {
        org_id,
        provider_customer_id: state.provider_customer_id.clone(),
        provider_subscription_id: Some(state.provider_subscription_id.clone()),
        plan,
        interval,
        status,
        current_period_start: state.current_period_start,
        current_period_end: state.current_period_end,
        cancel_at_period_end: state.cancel_at_period_end
            && status != SubscriptionStatus::Canceled,
        pending_plan: None,
        pending_interval: None,
        failed_payment_count: 0,
        grace_period_end: None,
        last_payment_error: None,
    })
}

fn apply_subscription_synced(
    catalog: &PlanCatalog,
    org_id: Uuid,
    current: Option<&SubscriptionRecord>,
    state: &ProviderSubscriptionState,
) -> Reconciled {
    let base = current
        .cloned()
        .unwrap_or_else(|| SubscriptionRecord::implicit_free(org_id));

    let (plan, interval) = resolve_plan(catalog, state.price_id.as_deref());
    let mapped = SubscriptionStatus::from_provider(&state.provider_status);

    // A provider-reported terminal status collapses to the same record
    // shape as an explicit deletion event.
    if mapped == SubscriptionStatus::Canceled {
        let record = SubscriptionRecord {
            provider_customer_id: state
                .provider_customer_id
                .clone()
                .or(base.provider_customer_id),
            provider_subscription_id: Some(state.provider_subscription_id.clone()),
            plan: PlanTier::Free,
            status: SubscriptionStatus::Canceled,
            current_period_start: state.current_period_start,
            current_period_end: state.current_period_end,
            cancel_at_period_end: false,
            pending_plan: None,
            pending_interval: None,
            failed_payment_count: 0,
            grace_period_end: None,
            last_payment_error: None,
            ..base
        };
        return Reconciled::record_only(record);
    }

    // Dunning owns the past-due flag: while failures are being counted the
    // record stays past_due until an invoice-paid event resets it, even if
    // the provider already reports the subscription healthy again.
    let status = if base.failed_payment_count > 0 {
        SubscriptionStatus::PastDue
    } else {
        mapped
    };

    // A scheduled change stays pending until the provider confirms the
    // matching plan, and evaporates the moment the subscription leaves
    // good standing.
    let (pending_plan, pending_interval) = if !status.keeps_pending_change() {
        (None, None)
    } else if base.pending_plan == Some(plan)
        && base.pending_interval.unwrap_or(interval) == interval
    {
        (None, None)
    } else {
        (base.pending_plan, base.pending_interval)
    };

    // Dunning fields are owned by invoice events and pass through untouched.
    Reconciled::record_only(SubscriptionRecord {
        org_id,
        provider_customer_id: state
            .provider_customer_id
            .clone()
            .or(base.provider_customer_id),
        provider_subscription_id: Some(state.provider_subscription_id.clone()),
        plan,
        interval,
        status,
        current_period_start: state.current_period_start,
        current_period_end: state.current_period_end,
        cancel_at_period_end: state.cancel_at_period_end,
        pending_plan,
        pending_interval,
        failed_payment_count: base.failed_payment_count,
        grace_period_end: base.grace_period_end,
        last_payment_error: base.last_payment_error,
    })
}

fn apply_subscription_deleted(org_id: Uuid, current: Option<&SubscriptionRecord>) -> Reconciled {
    let base = current
        .cloned()
        .unwrap_or_else(|| SubscriptionRecord::implicit_free(org_id));
    let access_until = base.current_period_end;

    // Terminal regardless of prior state. Provider ids are kept for audit;
    // a new checkout produces a replacement record.
    let record = SubscriptionRecord {
        plan: PlanTier::Free,
        status: SubscriptionStatus::Canceled,
        cancel_at_period_end: false,
        pending_plan: None,
        pending_interval: None,
        failed_payment_count: 0,
        grace_period_end: None,
        last_payment_error: None,
        ..base
    };

    Reconciled {
        record,
        effects: vec![SideEffect::NotifyCanceled { access_until }],
    }
}

fn apply_invoice_paid(org_id: Uuid, current: Option<&SubscriptionRecord>) -> Reconciled {
    let base = current
        .cloned()
        .unwrap_or_else(|| SubscriptionRecord::implicit_free(org_id));

    // A late invoice for an already-deleted subscription must not
    // resurrect it.
    if base.status == SubscriptionStatus::Canceled {
        return Reconciled::record_only(base);
    }

    let mut effects = Vec::new();
    if let Some(pending) = base.pending_plan {
        // Payment for a new period: a scheduled change is now due.
        effects.push(SideEffect::ApplyPendingChange {
            plan: pending,
            interval: base.pending_interval.unwrap_or(base.interval),
        });
    }

    let record = SubscriptionRecord {
        status: SubscriptionStatus::Active,
        failed_payment_count: 0,
        grace_period_end: None,
        last_payment_error: None,
        ..base
    };

    Reconciled { record, effects }
}

fn apply_invoice_payment_failed(
    org_id: Uuid,
    current: Option<&SubscriptionRecord>,
    error_message: Option<&str>,
    now: OffsetDateTime,
) -> Reconciled {
    let base = current
        .cloned()
        .unwrap_or_else(|| SubscriptionRecord::implicit_free(org_id));

    if base.status == SubscriptionStatus::Canceled {
        return Reconciled::record_only(base);
    }

    // Read-then-increment against the persisted value; the caller holds the
    // row lock, and duplicate deliveries were already filtered by event id.
    let failure_count = base.failed_payment_count + 1;
    let deadline = policy::grace_deadline(now);
    let error = error_message.unwrap_or("Payment failed").to_string();

    let record = SubscriptionRecord {
        status: SubscriptionStatus::PastDue,
        pending_plan: None,
        pending_interval: None,
        failed_payment_count: failure_count,
        grace_period_end: Some(deadline),
        last_payment_error: Some(error.clone()),
        ..base
    };

    Reconciled {
        record,
        effects: vec![SideEffect::NotifyPaymentFailed {
            failure_count,
            grace_period_end: deadline,
            error,
        }],
    }
}

/// The record invariants from the data model, checked on every output in
/// debug builds and audited against the database by the invariant checker.
fn invariants_hold(record: &SubscriptionRecord) -> bool {
    if record.failed_payment_count > 0
        && (record.status != SubscriptionStatus::PastDue || record.grace_period_end.is_none())
    {
        return false;
    }
    if record.status == SubscriptionStatus::Canceled
        && (record.plan != PlanTier::Free
            || record.cancel_at_period_end
            || record.grace_period_end.is_some())
    {
        return false;
    }
    if record.pending_plan.is_some() && !record.status.keeps_pending_change() {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PlanCatalog;
    use crate::client::PriceIds;
    use time::Duration;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(&PriceIds {
            standard_monthly: "price_std_m".into(),
            standard_yearly: "price_std_y".into(),
            plus_monthly: "price_plus_m".into(),
            plus_yearly: "price_plus_y".into(),
            business_monthly: "price_biz_m".into(),
            business_yearly: "price_biz_y".into(),
        })
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    fn subscription_state(org_id: Uuid, price_id: &str, status: &str) -> ProviderSubscriptionState {
        ProviderSubscriptionState {
            org_id,
            provider_customer_id: Some("cus_123".into()),
            provider_subscription_id: "sub_123".into(),
            price_id: Some(price_id.into()),
            provider_status: status.into(),
            current_period_start: Some(now()),
            current_period_end: Some(now() + Duration::days(30)),
            cancel_at_period_end: false,
        }
    }

    fn event(kind: BillingEventKind) -> BillingEvent {
        BillingEvent::new("evt_1", now(), kind)
    }

    #[test]
    fn checkout_creates_record_from_scratch() {
        let org_id = Uuid::new_v4();
        let state = subscription_state(org_id, "price_std_m", "active");
        let out = apply(
            &catalog(),
            org_id,
            None,
            &event(BillingEventKind::CheckoutCompleted(state)),
            now(),
        );

        assert_eq!(PlanTier::Standard, out.record.plan);
        assert_eq!(BillingInterval::Monthly, out.record.interval);
        assert_eq!(SubscriptionStatus::Active, out.record.status);
        assert_eq!(0, out.record.failed_payment_count);
        assert_eq!(None, out.record.grace_period_end);
        assert!(out.effects.is_empty());
    }

    #[test]
    fn checkout_with_unknown_price_resolves_to_free() {
        let org_id = Uuid::new_v4();
        let state = subscription_state(org_id, "price_legacy_gold", "active");
        let out = apply(
            &catalog(),
            org_id,
            None,
            &event(BillingEventKind::CheckoutCompleted(state)),
            now(),
        );
        assert_eq!(PlanTier::Free, out.record.plan);
    }

    #[test]
    fn checkout_maps_unhealthy_provider_status_to_past_due() {
        let org_id = Uuid::new_v4();
        let state = subscription_state(org_id, "price_std_m", "incomplete");
        let out = apply(
            &catalog(),
            org_id,
            None,
            &event(BillingEventKind::CheckoutCompleted(state)),
            now(),
        );
        assert_eq!(SubscriptionStatus::PastDue, out.record.status);
    }

    #[test]
    fn failed_payment_sequence_counts_and_advances_grace() {
        let org_id = Uuid::new_v4();
        let state = subscription_state(org_id, "price_plus_m", "active");
        let mut record = apply(
            &catalog(),
            org_id,
            None,
            &event(BillingEventKind::CheckoutCompleted(state)),
            now(),
        )
        .record;

        let first_failure_at = now() + Duration::days(30);
        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &BillingEvent::new(
                "evt_fail_1",
                first_failure_at,
                BillingEventKind::InvoicePaymentFailed {
                    error_message: Some("card_declined".into()),
                },
            ),
            first_failure_at,
        );
        record = out.record;

        assert_eq!(SubscriptionStatus::PastDue, record.status);
        assert_eq!(1, record.failed_payment_count);
        assert_eq!(
            Some(first_failure_at + Duration::days(10)),
            record.grace_period_end
        );
        assert_eq!(Some("card_declined".to_string()), record.last_payment_error);
        assert!(matches!(
            out.effects.as_slice(),
            [SideEffect::NotifyPaymentFailed {
                failure_count: 1,
                ..
            }]
        ));

        // Second failure ten minutes later: count goes to 2 and the grace
        // deadline advances to the newer failure time.
        let second_failure_at = first_failure_at + Duration::minutes(10);
        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &BillingEvent::new(
                "evt_fail_2",
                second_failure_at,
                BillingEventKind::InvoicePaymentFailed {
                    error_message: None,
                },
            ),
            second_failure_at,
        );
        record = out.record;

        assert_eq!(2, record.failed_payment_count);
        assert_eq!(
            Some(second_failure_at + Duration::days(10)),
            record.grace_period_end
        );
        assert_eq!(Some("Payment failed".to_string()), record.last_payment_error);
    }

    #[test]
    fn invoice_paid_resets_dunning_state() {
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Plus;
        record.status = SubscriptionStatus::PastDue;
        record.failed_payment_count = 2;
        record.grace_period_end = Some(now() + Duration::days(3));
        record.last_payment_error = Some("card_declined".into());

        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::InvoicePaid),
            now(),
        );

        assert_eq!(SubscriptionStatus::Active, out.record.status);
        assert_eq!(0, out.record.failed_payment_count);
        assert_eq!(None, out.record.grace_period_end);
        assert_eq!(None, out.record.last_payment_error);
        assert!(out.effects.is_empty());
    }

    #[test]
    fn invoice_paid_is_idempotent() {
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Standard;
        record.status = SubscriptionStatus::PastDue;
        record.failed_payment_count = 1;
        record.grace_period_end = Some(now());

        let once = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::InvoicePaid),
            now(),
        );
        let twice = apply(
            &catalog(),
            org_id,
            Some(&once.record),
            &event(BillingEventKind::InvoicePaid),
            now(),
        );
        assert_eq!(once.record, twice.record);
    }

    #[test]
    fn invoice_paid_schedules_pending_change_application() {
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Plus;
        record.interval = BillingInterval::Monthly;
        record.status = SubscriptionStatus::Active;
        record.pending_plan = Some(PlanTier::Standard);
        record.pending_interval = Some(BillingInterval::Monthly);

        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::InvoicePaid),
            now(),
        );

        assert_eq!(
            vec![SideEffect::ApplyPendingChange {
                plan: PlanTier::Standard,
                interval: BillingInterval::Monthly,
            }],
            out.effects
        );
        // The pending marker stays until the provider confirms the change.
        assert_eq!(Some(PlanTier::Standard), out.record.pending_plan);
    }

    #[test]
    fn deleted_is_terminal_regardless_of_prior_state() {
        let org_id = Uuid::new_v4();
        let priors = [
            {
                let mut r = SubscriptionRecord::implicit_free(org_id);
                r.plan = PlanTier::Business;
                r.status = SubscriptionStatus::Active;
                r.cancel_at_period_end = true;
                r
            },
            {
                let mut r = SubscriptionRecord::implicit_free(org_id);
                r.plan = PlanTier::Standard;
                r.status = SubscriptionStatus::PastDue;
                r.failed_payment_count = 3;
                r.grace_period_end = Some(now());
                r
            },
            {
                let mut r = SubscriptionRecord::implicit_free(org_id);
                r.plan = PlanTier::Plus;
                r.status = SubscriptionStatus::Trialing;
                r.pending_plan = Some(PlanTier::Standard);
                r
            },
        ];

        for prior in priors {
            let out = apply(
                &catalog(),
                org_id,
                Some(&prior),
                &event(BillingEventKind::SubscriptionDeleted),
                now(),
            );
            assert_eq!(PlanTier::Free, out.record.plan);
            assert_eq!(SubscriptionStatus::Canceled, out.record.status);
            assert!(!out.record.cancel_at_period_end);
            assert_eq!(None, out.record.grace_period_end);
            assert_eq!(0, out.record.failed_payment_count);
            assert_eq!(None, out.record.pending_plan);
        }
    }

    #[test]
    fn late_invoice_events_do_not_resurrect_a_canceled_record() {
        let org_id = Uuid::new_v4();
        let canceled = apply(
            &catalog(),
            org_id,
            None,
            &event(BillingEventKind::SubscriptionDeleted),
            now(),
        )
        .record;

        let paid = apply(
            &catalog(),
            org_id,
            Some(&canceled),
            &event(BillingEventKind::InvoicePaid),
            now(),
        );
        assert_eq!(canceled, paid.record);
        assert!(paid.effects.is_empty());

        let failed = apply(
            &catalog(),
            org_id,
            Some(&canceled),
            &event(BillingEventKind::InvoicePaymentFailed {
                error_message: None,
            }),
            now(),
        );
        assert_eq!(canceled, failed.record);
        assert!(failed.effects.is_empty());
    }

    #[test]
    fn synced_rederives_plan_without_touching_dunning() {
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Standard;
        record.status = SubscriptionStatus::PastDue;
        record.failed_payment_count = 2;
        record.grace_period_end = Some(now() + Duration::days(5));
        record.last_payment_error = Some("card_declined".into());

        let mut state = subscription_state(org_id, "price_plus_y", "past_due");
        state.cancel_at_period_end = true;

        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::SubscriptionSynced(state)),
            now(),
        );

        assert_eq!(PlanTier::Plus, out.record.plan);
        assert_eq!(BillingInterval::Yearly, out.record.interval);
        assert!(out.record.cancel_at_period_end);
        // Invoice-owned fields pass through.
        assert_eq!(2, out.record.failed_payment_count);
        assert_eq!(record.grace_period_end, out.record.grace_period_end);
        assert_eq!(record.last_payment_error, out.record.last_payment_error);
    }

    #[test]
    fn synced_clears_pending_once_the_change_lands() {
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Plus;
        record.status = SubscriptionStatus::Active;
        record.pending_plan = Some(PlanTier::Standard);
        record.pending_interval = Some(BillingInterval::Monthly);

        // Unrelated sync keeps the pending change.
        let unrelated = subscription_state(org_id, "price_plus_m", "active");
        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::SubscriptionSynced(unrelated)),
            now(),
        );
        assert_eq!(Some(PlanTier::Standard), out.record.pending_plan);

        // The provider confirming the pending plan clears it.
        let landed = subscription_state(org_id, "price_std_m", "active");
        let out = apply(
            &catalog(),
            org_id,
            Some(&out.record),
            &event(BillingEventKind::SubscriptionSynced(landed)),
            now(),
        );
        assert_eq!(None, out.record.pending_plan);
        assert_eq!(None, out.record.pending_interval);
        assert_eq!(PlanTier::Standard, out.record.plan);
    }

    #[test]
    fn synced_into_past_due_drops_pending_change() {
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Plus;
        record.status = SubscriptionStatus::Active;
        record.pending_plan = Some(PlanTier::Standard);

        let state = subscription_state(org_id, "price_plus_m", "unpaid");
        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::SubscriptionSynced(state)),
            now(),
        );
        assert_eq!(SubscriptionStatus::PastDue, out.record.status);
        assert_eq!(None, out.record.pending_plan);
    }

    #[test]
    fn synced_is_idempotent() {
        let org_id = Uuid::new_v4();
        let state = subscription_state(org_id, "price_biz_y", "active");
        let ev = event(BillingEventKind::SubscriptionSynced(state));

        let once = apply(&catalog(), org_id, None, &ev, now());
        let twice = apply(&catalog(), org_id, Some(&once.record), &ev, now());
        assert_eq!(once.record, twice.record);
    }

    #[test]
    fn synced_terminal_provider_status_collapses_to_free() {
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Business;
        record.status = SubscriptionStatus::Active;
        record.provider_subscription_id = Some("sub_123".into());

        let state = subscription_state(org_id, "price_biz_m", "incomplete_expired");
        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::SubscriptionSynced(state)),
            now(),
        );

        assert_eq!(PlanTier::Free, out.record.plan);
        assert_eq!(SubscriptionStatus::Canceled, out.record.status);
        assert!(!out.record.cancel_at_period_end);
        assert_eq!(0, out.record.failed_payment_count);
    }

    #[test]
    fn synced_active_while_dunning_stays_past_due() {
        // The provider can report the subscription healthy before the
        // confirming invoice-paid event arrives; only invoice events may
        // clear the dunning counter.
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Standard;
        record.status = SubscriptionStatus::PastDue;
        record.failed_payment_count = 1;
        record.grace_period_end = Some(now() + Duration::days(9));

        let state = subscription_state(org_id, "price_std_m", "active");
        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::SubscriptionSynced(state)),
            now(),
        );

        assert_eq!(SubscriptionStatus::PastDue, out.record.status);
        assert_eq!(1, out.record.failed_payment_count);
        assert_eq!(record.grace_period_end, out.record.grace_period_end);
    }

    #[test]
    fn failed_payment_drops_pending_change() {
        let org_id = Uuid::new_v4();
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Plus;
        record.status = SubscriptionStatus::Active;
        record.pending_plan = Some(PlanTier::Standard);

        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &event(BillingEventKind::InvoicePaymentFailed {
                error_message: None,
            }),
            now(),
        );
        assert_eq!(None, out.record.pending_plan);
        assert_eq!(SubscriptionStatus::PastDue, out.record.status);
    }
}
