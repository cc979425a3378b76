// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Core
//!
//! Tests critical boundary conditions in:
//! - Webhook signature verification (BILL-V01 to BILL-V06)
//! - Dunning sequences (BILL-D01 to BILL-D04)
//! - Full subscription lifecycle (BILL-L01 to BILL-L03)
//! - Catalog ordering (BILL-C01 to BILL-C02)

#[cfg(test)]
mod webhook_verification_tests {
    use crate::error::BillingError;
    use crate::webhooks::verify_signature;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    const SECRET: &str = "whsec_test_secret_key";
    const NOW: i64 = 1_750_000_000;

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    // =========================================================================
    // BILL-V01: Valid signature is accepted
    // =========================================================================
    #[test]
    fn valid_signature_accepted() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let header = sign(payload, NOW, SECRET);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }

    // =========================================================================
    // BILL-V02: Tampered payload is rejected
    // =========================================================================
    #[test]
    fn tampered_payload_rejected() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let header = sign(payload, NOW, SECRET);
        let tampered = r#"{"id":"evt_1","type":"invoice.payment_failed"}"#;
        assert!(matches!(
            verify_signature(tampered, &header, SECRET, NOW),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    // =========================================================================
    // BILL-V03: Signature made with the wrong secret is rejected
    // =========================================================================
    #[test]
    fn wrong_secret_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, NOW, "whsec_other_secret");
        assert!(verify_signature(payload, &header, SECRET, NOW).is_err());
    }

    // =========================================================================
    // BILL-V04: Stale timestamp outside the tolerance window is rejected
    // =========================================================================
    #[test]
    fn stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let stale = NOW - 301;
        let header = sign(payload, stale, SECRET);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_err());

        // Exactly at the tolerance boundary is still accepted.
        let boundary = NOW - 300;
        let header = sign(payload, boundary, SECRET);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }

    // =========================================================================
    // BILL-V05: Missing header parts are rejected
    // =========================================================================
    #[test]
    fn malformed_headers_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        for header in ["", "t=123", "v1=abc", "nonsense", "t=abc,v1=def"] {
            assert!(
                verify_signature(payload, header, SECRET, NOW).is_err(),
                "header {:?} must be rejected",
                header
            );
        }
    }

    // =========================================================================
    // BILL-V06: Extra signature-header fields are tolerated
    // =========================================================================
    #[test]
    fn extra_header_fields_tolerated() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = format!("{},v0=deadbeef", sign(payload, NOW, SECRET));
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }
}

#[cfg(test)]
mod dunning_sequence_tests {
    use crate::catalog::PlanCatalog;
    use crate::client::PriceIds;
    use crate::events::{BillingEvent, BillingEventKind};
    use crate::policy;
    use crate::reconcile::{apply, SubscriptionRecord};
    use cove_shared::{PlanTier, SubscriptionStatus};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

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

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    fn active_record(org_id: Uuid) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::implicit_free(org_id);
        record.plan = PlanTier::Standard;
        record.provider_subscription_id = Some("sub_1".into());
        record.provider_customer_id = Some("cus_1".into());
        record
    }

    // =========================================================================
    // BILL-D01: N failures without an intervening payment count exactly N,
    // and the deadline tracks the most recent failure
    // =========================================================================
    #[test]
    fn failure_count_equals_number_of_failure_events() {
        let org_id = Uuid::new_v4();
        let mut record = active_record(org_id);

        let mut failure_time = t0();
        for n in 1..=5 {
            failure_time += Duration::days(1);
            let out = apply(
                &catalog(),
                org_id,
                Some(&record),
                &BillingEvent::new(
                    format!("evt_fail_{}", n),
                    failure_time,
                    BillingEventKind::InvoicePaymentFailed {
                        error_message: None,
                    },
                ),
                failure_time,
            );
            record = out.record;
            assert_eq!(n, record.failed_payment_count);
            assert_eq!(Some(policy::grace_deadline(failure_time)), record.grace_period_end);
        }
    }

    // =========================================================================
    // BILL-D02: Payment after any number of failures fully resets dunning
    // =========================================================================
    #[test]
    fn payment_resets_after_long_dunning_sequence() {
        let org_id = Uuid::new_v4();
        let mut record = active_record(org_id);
        record.status = SubscriptionStatus::PastDue;
        record.failed_payment_count = 7;
        record.grace_period_end = Some(t0());
        record.last_payment_error = Some("insufficient_funds".into());

        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &BillingEvent::new("evt_paid", t0(), BillingEventKind::InvoicePaid),
            t0(),
        );

        assert_eq!(SubscriptionStatus::Active, out.record.status);
        assert_eq!(0, out.record.failed_payment_count);
        assert_eq!(None, out.record.grace_period_end);
        assert_eq!(None, out.record.last_payment_error);
    }

    // =========================================================================
    // BILL-D03: Access restriction flips exactly at the grace deadline
    // =========================================================================
    #[test]
    fn restriction_boundary_is_inclusive() {
        let org_id = Uuid::new_v4();
        let failure_at = t0();
        let out = apply(
            &catalog(),
            org_id,
            Some(&active_record(org_id)),
            &BillingEvent::new(
                "evt_fail",
                failure_at,
                BillingEventKind::InvoicePaymentFailed {
                    error_message: None,
                },
            ),
            failure_at,
        );

        let deadline = out.record.grace_period_end.unwrap();
        assert!(!policy::is_access_restricted(
            &out.record,
            deadline - Duration::seconds(1)
        ));
        assert!(policy::is_access_restricted(&out.record, deadline));
    }

    // =========================================================================
    // BILL-D04: A failure right after checkout starts counting from one
    // =========================================================================
    #[test]
    fn first_failure_after_checkout_counts_from_one() {
        let org_id = Uuid::new_v4();
        let record = active_record(org_id);
        assert_eq!(0, record.failed_payment_count);

        let out = apply(
            &catalog(),
            org_id,
            Some(&record),
            &BillingEvent::new(
                "evt_fail",
                t0(),
                BillingEventKind::InvoicePaymentFailed {
                    error_message: None,
                },
            ),
            t0(),
        );
        assert_eq!(1, out.record.failed_payment_count);
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use crate::catalog::PlanCatalog;
    use crate::client::PriceIds;
    use crate::events::{BillingEvent, BillingEventKind, ProviderSubscriptionState};
    use crate::reconcile::{apply, SubscriptionRecord};
    use cove_shared::{BillingInterval, PlanTier, SubscriptionStatus};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

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

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    fn state(org_id: Uuid, price_id: &str, status: &str) -> ProviderSubscriptionState {
        ProviderSubscriptionState {
            org_id,
            provider_customer_id: Some("cus_1".into()),
            provider_subscription_id: "sub_1".into(),
            price_id: Some(price_id.into()),
            provider_status: status.into(),
            current_period_start: Some(t0()),
            current_period_end: Some(t0() + Duration::days(30)),
            cancel_at_period_end: false,
        }
    }

    // =========================================================================
    // BILL-L01: checkout -> two failures -> payment -> cancel-at-period-end
    // -> deletion walks the full state machine
    // =========================================================================
    #[test]
    fn full_lifecycle_walkthrough() {
        let org_id = Uuid::new_v4();
        let cat = catalog();

        // No record + checkout(standard monthly) = active standard record.
        let mut record: SubscriptionRecord = apply(
            &cat,
            org_id,
            None,
            &BillingEvent::new(
                "evt_checkout",
                t0(),
                BillingEventKind::CheckoutCompleted(state(org_id, "price_std_m", "active")),
            ),
            t0(),
        )
        .record;
        assert_eq!(PlanTier::Standard, record.plan);
        assert_eq!(SubscriptionStatus::Active, record.status);

        // Two failed invoices.
        for (n, id) in [(1, "evt_f1"), (2, "evt_f2")] {
            record = apply(
                &cat,
                org_id,
                Some(&record),
                &BillingEvent::new(
                    id,
                    t0(),
                    BillingEventKind::InvoicePaymentFailed {
                        error_message: None,
                    },
                ),
                t0(),
            )
            .record;
            assert_eq!(n, record.failed_payment_count);
            assert_eq!(SubscriptionStatus::PastDue, record.status);
        }

        // Payment recovers the subscription.
        record = apply(
            &cat,
            org_id,
            Some(&record),
            &BillingEvent::new("evt_paid", t0(), BillingEventKind::InvoicePaid),
            t0(),
        )
        .record;
        assert_eq!(SubscriptionStatus::Active, record.status);
        assert_eq!(0, record.failed_payment_count);

        // User cancels through the provider portal; the sync event carries
        // cancel_at_period_end.
        let mut cancel_state = state(org_id, "price_std_m", "active");
        cancel_state.cancel_at_period_end = true;
        record = apply(
            &cat,
            org_id,
            Some(&record),
            &BillingEvent::new(
                "evt_sync",
                t0(),
                BillingEventKind::SubscriptionSynced(cancel_state),
            ),
            t0(),
        )
        .record;
        assert!(record.cancel_at_period_end);
        assert_eq!(PlanTier::Standard, record.plan);

        // Period ends; the provider deletes the subscription.
        record = apply(
            &cat,
            org_id,
            Some(&record),
            &BillingEvent::new("evt_del", t0(), BillingEventKind::SubscriptionDeleted),
            t0(),
        )
        .record;
        assert_eq!(PlanTier::Free, record.plan);
        assert_eq!(SubscriptionStatus::Canceled, record.status);
        assert!(!record.cancel_at_period_end);
        assert_eq!(None, record.grace_period_end);
    }

    // =========================================================================
    // BILL-L02: A replacement checkout after deletion starts a fresh record
    // =========================================================================
    #[test]
    fn checkout_after_deletion_starts_fresh() {
        let org_id = Uuid::new_v4();
        let cat = catalog();

        let canceled = apply(
            &cat,
            org_id,
            None,
            &BillingEvent::new("evt_del", t0(), BillingEventKind::SubscriptionDeleted),
            t0(),
        )
        .record;

        let mut new_state = state(org_id, "price_plus_y", "trialing");
        new_state.provider_subscription_id = "sub_2".into();
        let record = apply(
            &cat,
            org_id,
            Some(&canceled),
            &BillingEvent::new(
                "evt_checkout2",
                t0(),
                BillingEventKind::CheckoutCompleted(new_state),
            ),
            t0(),
        )
        .record;

        assert_eq!(PlanTier::Plus, record.plan);
        assert_eq!(BillingInterval::Yearly, record.interval);
        assert_eq!(SubscriptionStatus::Trialing, record.status);
        assert_eq!(Some("sub_2".to_string()), record.provider_subscription_id);
        assert_eq!(0, record.failed_payment_count);
    }

    // =========================================================================
    // BILL-L03: Out-of-order sync after deletion stays canceled only for
    // invoice events; a sync is authoritative and may revive the record
    // =========================================================================
    #[test]
    fn sync_after_deletion_follows_provider() {
        let org_id = Uuid::new_v4();
        let cat = catalog();

        let canceled = apply(
            &cat,
            org_id,
            None,
            &BillingEvent::new("evt_del", t0(), BillingEventKind::SubscriptionDeleted),
            t0(),
        )
        .record;

        // The provider says a (new) subscription is active: trust it.
        let record = apply(
            &cat,
            org_id,
            Some(&canceled),
            &BillingEvent::new(
                "evt_sync",
                t0(),
                BillingEventKind::SubscriptionSynced(state(org_id, "price_std_m", "active")),
            ),
            t0(),
        )
        .record;
        assert_eq!(SubscriptionStatus::Active, record.status);
        assert_eq!(PlanTier::Standard, record.plan);
    }
}

#[cfg(test)]
mod catalog_ordering_tests {
    use crate::catalog::{PlanCatalog, PlanChange};
    use crate::client::PriceIds;
    use cove_shared::{BillingInterval, PlanTier};

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

    // =========================================================================
    // BILL-C01: Classification is antisymmetric: A->B upgrade iff B->A
    // downgrade
    // =========================================================================
    #[test]
    fn classification_is_antisymmetric() {
        let cat = catalog();
        let m = BillingInterval::Monthly;
        for a in PlanTier::all() {
            for b in PlanTier::all() {
                let ab = cat.classify_change(a, m, b, m);
                let ba = cat.classify_change(b, m, a, m);
                match ab {
                    PlanChange::Upgrade => assert_eq!(PlanChange::Downgrade, ba),
                    PlanChange::Downgrade => assert_eq!(PlanChange::Upgrade, ba),
                    PlanChange::NoChange => assert_eq!(PlanChange::NoChange, ba),
                    PlanChange::SwitchInterval => unreachable!(),
                }
            }
        }
    }

    // =========================================================================
    // BILL-C02: Every configured price id resolves, and to distinct plans
    // =========================================================================
    #[test]
    fn all_configured_price_ids_resolve_uniquely() {
        let cat = catalog();
        let ids = [
            "price_std_m",
            "price_std_y",
            "price_plus_m",
            "price_plus_y",
            "price_biz_m",
            "price_biz_y",
        ];
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            let resolved = cat.plan_for_price_id(id).unwrap();
            assert!(seen.insert(resolved), "price id {} resolved ambiguously", id);
        }
    }
}
