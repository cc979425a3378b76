//! Plan catalog and tier comparison.
//!
//! The catalog is the single mapping between our plan tiers and the
//! provider's price ids. It is built once at startup from configuration
//! and consulted for two things: resolving an inbound price id to a
//! `(tier, interval)` pair, and classifying a requested plan change as an
//! upgrade, downgrade, or interval switch.

use cove_shared::{BillingInterval, PlanTier};

use crate::client::PriceIds;

/// Feature flags granted by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PlanFeatures {
    /// Invite guests from outside the organization.
    pub guest_access: bool,
    /// Remove the free-tier board cap.
    pub unlimited_boards: bool,
    /// Document version history beyond 7 days.
    pub version_history: bool,
    /// SAML single sign-on.
    pub sso: bool,
}

impl PlanFeatures {
    pub fn for_tier(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Free => Self {
                guest_access: false,
                unlimited_boards: false,
                version_history: false,
                sso: false,
            },
            PlanTier::Standard => Self {
                guest_access: true,
                unlimited_boards: true,
                version_history: false,
                sso: false,
            },
            PlanTier::Plus => Self {
                guest_access: true,
                unlimited_boards: true,
                version_history: true,
                sso: false,
            },
            PlanTier::Business => Self {
                guest_access: true,
                unlimited_boards: true,
                version_history: true,
                sso: true,
            },
        }
    }
}

/// One entry in the plan catalog.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanDefinition {
    pub tier: PlanTier,
    pub display_name: &'static str,
    /// Price in cents for each interval; zero for the free tier.
    pub monthly_price_cents: i64,
    pub yearly_price_cents: i64,
    pub features: PlanFeatures,
    /// Ordering index used for upgrade/downgrade comparison.
    pub order: u8,
    /// Provider price ids; `None` for the free tier.
    #[serde(skip)]
    pub monthly_price_id: Option<String>,
    #[serde(skip)]
    pub yearly_price_id: Option<String>,
}

/// Classification of a requested plan change, driven by catalog ordering.
///
/// This drives session/UI semantics only; once a change is confirmed the
/// reconciler trusts whatever the provider reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanChange {
    Upgrade,
    Downgrade,
    SwitchInterval,
    NoChange,
}

/// Static, ordered plan catalog.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl PlanCatalog {
    /// Build the catalog from configured price ids.
    pub fn new(price_ids: &PriceIds) -> Self {
        let plan = |tier: PlanTier,
                    display_name: &'static str,
                    monthly: i64,
                    yearly: i64,
                    monthly_id: Option<&str>,
                    yearly_id: Option<&str>| PlanDefinition {
            tier,
            display_name,
            monthly_price_cents: monthly,
            yearly_price_cents: yearly,
            features: PlanFeatures::for_tier(tier),
            order: tier.rank(),
            monthly_price_id: monthly_id.map(str::to_owned),
            yearly_price_id: yearly_id.map(str::to_owned),
        };

        Self {
            plans: vec![
                plan(PlanTier::Free, "Free", 0, 0, None, None),
                plan(
                    PlanTier::Standard,
                    "Standard",
                    800,
                    8_000,
                    Some(&price_ids.standard_monthly),
                    Some(&price_ids.standard_yearly),
                ),
                plan(
                    PlanTier::Plus,
                    "Plus",
                    1_500,
                    15_000,
                    Some(&price_ids.plus_monthly),
                    Some(&price_ids.plus_yearly),
                ),
                plan(
                    PlanTier::Business,
                    "Business",
                    2_500,
                    25_000,
                    Some(&price_ids.business_monthly),
                    Some(&price_ids.business_yearly),
                ),
            ],
        }
    }

    pub fn plans(&self) -> &[PlanDefinition] {
        &self.plans
    }

    pub fn definition(&self, tier: PlanTier) -> Option<&PlanDefinition> {
        self.plans.iter().find(|p| p.tier == tier)
    }

    /// Resolve a provider price id to the tier and interval it bills.
    ///
    /// Returns `None` for unrecognized price ids; the reconciler treats
    /// that as the free plan (fail-safe, never fail-open).
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<(PlanTier, BillingInterval)> {
        for plan in &self.plans {
            if plan.monthly_price_id.as_deref() == Some(price_id) {
                return Some((plan.tier, BillingInterval::Monthly));
            }
            if plan.yearly_price_id.as_deref() == Some(price_id) {
                return Some((plan.tier, BillingInterval::Yearly));
            }
        }
        None
    }

    /// Classify a requested change from the current plan to a target plan.
    pub fn classify_change(
        &self,
        current: PlanTier,
        current_interval: BillingInterval,
        target: PlanTier,
        target_interval: BillingInterval,
    ) -> PlanChange {
        if target.rank() > current.rank() {
            PlanChange::Upgrade
        } else if target.rank() < current.rank() {
            PlanChange::Downgrade
        } else if target_interval != current_interval && target.is_paid() {
            PlanChange::SwitchInterval
        } else {
            PlanChange::NoChange
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_price_ids() -> PriceIds {
        PriceIds {
            standard_monthly: "price_std_m".into(),
            standard_yearly: "price_std_y".into(),
            plus_monthly: "price_plus_m".into(),
            plus_yearly: "price_plus_y".into(),
            business_monthly: "price_biz_m".into(),
            business_yearly: "price_biz_y".into(),
        }
    }

    #[test]
    fn resolves_price_ids_to_tier_and_interval() {
        let catalog = PlanCatalog::new(&test_price_ids());
        assert_eq!(
            Some((PlanTier::Standard, BillingInterval::Monthly)),
            catalog.plan_for_price_id("price_std_m")
        );
        assert_eq!(
            Some((PlanTier::Business, BillingInterval::Yearly)),
            catalog.plan_for_price_id("price_biz_y")
        );
        assert_eq!(None, catalog.plan_for_price_id("price_unknown"));
    }

    #[test]
    fn classification_is_consistent_with_ordering() {
        let catalog = PlanCatalog::new(&test_price_ids());
        let m = BillingInterval::Monthly;

        for a in PlanTier::all() {
            for b in PlanTier::all() {
                let change = catalog.classify_change(a, m, b, m);
                match change {
                    PlanChange::Upgrade => assert!(b.rank() > a.rank()),
                    PlanChange::Downgrade => assert!(b.rank() < a.rank()),
                    PlanChange::NoChange => assert_eq!(a.rank(), b.rank()),
                    PlanChange::SwitchInterval => {
                        panic!("same interval must never classify as a switch")
                    }
                }
            }
        }
    }

    #[test]
    fn same_tier_different_interval_is_a_switch() {
        let catalog = PlanCatalog::new(&test_price_ids());
        assert_eq!(
            PlanChange::SwitchInterval,
            catalog.classify_change(
                PlanTier::Plus,
                BillingInterval::Monthly,
                PlanTier::Plus,
                BillingInterval::Yearly,
            )
        );
        // Free has no interval to switch.
        assert_eq!(
            PlanChange::NoChange,
            catalog.classify_change(
                PlanTier::Free,
                BillingInterval::Monthly,
                PlanTier::Free,
                BillingInterval::Yearly,
            )
        );
    }

    #[test]
    fn every_tier_has_exactly_one_definition() {
        let catalog = PlanCatalog::new(&test_price_ids());
        for tier in PlanTier::all() {
            let count = catalog.plans().iter().filter(|p| p.tier == tier).count();
            assert_eq!(1, count, "tier {} must appear exactly once", tier);
        }
    }
}
