//! Common billing types shared between the API server and the billing core.

use serde::{Deserialize, Serialize};

/// Subscription plan tier.
///
/// The ordering of the variants is the catalog ordering: a change to a
/// higher-ranked tier is an upgrade, to a lower-ranked tier a downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Standard,
    Plus,
    Business,
}

impl PlanTier {
    /// Ordering index used for upgrade/downgrade comparison.
    pub fn rank(&self) -> u8 {
        match self {
            PlanTier::Free => 0,
            PlanTier::Standard => 1,
            PlanTier::Plus => 2,
            PlanTier::Business => 3,
        }
    }

    pub fn is_paid(&self) -> bool {
        *self != PlanTier::Free
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Standard => "standard",
            PlanTier::Plus => "plus",
            PlanTier::Business => "business",
        }
    }

    /// All tiers in catalog order.
    pub fn all() -> [PlanTier; 4] {
        [
            PlanTier::Free,
            PlanTier::Standard,
            PlanTier::Plus,
            PlanTier::Business,
        ]
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(PlanTier::Free),
            "standard" => Ok(PlanTier::Standard),
            "plus" => Ok(PlanTier::Plus),
            "business" => Ok(PlanTier::Business),
            _ => Err(format!("unknown plan tier: {}", s)),
        }
    }
}

/// Billing interval for paid plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Yearly => "yearly",
        }
    }

    /// Lenient parse for user-supplied values ("annual" is accepted as an
    /// alias because older clients send it).
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "monthly" | "month" => Some(BillingInterval::Monthly),
            "yearly" | "year" | "annual" => Some(BillingInterval::Yearly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical subscription status.
///
/// The provider reports a wider set of statuses than we track. Every event
/// path maps through [`SubscriptionStatus::from_provider`] so checkout and
/// subscription-update events cannot disagree about what "incomplete" or
/// "unpaid" means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Canonical mapping from a provider-reported status string.
    ///
    /// Anything that means "the subscription exists but is not in good
    /// standing" collapses to `PastDue`; terminal states collapse to
    /// `Canceled`. Unknown strings are treated as `PastDue` rather than
    /// granting access.
    pub fn from_provider(s: &str) -> Self {
        match s {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
            "past_due" | "unpaid" | "incomplete" | "paused" => SubscriptionStatus::PastDue,
            _ => SubscriptionStatus::PastDue,
        }
    }

    /// Statuses under which a scheduled plan change remains meaningful.
    pub fn keeps_pending_change(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            _ => Err(format!("unknown subscription status: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_is_total() {
        let tiers = PlanTier::all();
        for a in tiers {
            for b in tiers {
                let lt = a.rank() < b.rank();
                let eq = a.rank() == b.rank();
                let gt = a.rank() > b.rank();
                assert_eq!(
                    1,
                    [lt, eq, gt].iter().filter(|v| **v).count(),
                    "exactly one of <, =, > must hold for {} vs {}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn tier_round_trips_through_strings() {
        for tier in PlanTier::all() {
            assert_eq!(Ok(tier), tier.as_str().parse());
        }
        assert!("platinum".parse::<PlanTier>().is_err());
    }

    #[test]
    fn provider_status_mapping_is_uniform() {
        use SubscriptionStatus::*;
        assert_eq!(Active, SubscriptionStatus::from_provider("active"));
        assert_eq!(Trialing, SubscriptionStatus::from_provider("trialing"));
        assert_eq!(PastDue, SubscriptionStatus::from_provider("past_due"));
        assert_eq!(PastDue, SubscriptionStatus::from_provider("unpaid"));
        assert_eq!(PastDue, SubscriptionStatus::from_provider("incomplete"));
        assert_eq!(PastDue, SubscriptionStatus::from_provider("paused"));
        assert_eq!(Canceled, SubscriptionStatus::from_provider("canceled"));
        assert_eq!(
            Canceled,
            SubscriptionStatus::from_provider("incomplete_expired")
        );
        // Never fail open on something we have not seen before.
        assert_eq!(PastDue, SubscriptionStatus::from_provider("mystery"));
    }

    #[test]
    fn interval_aliases() {
        assert_eq!(
            Some(BillingInterval::Yearly),
            BillingInterval::from_str_opt("annual")
        );
        assert_eq!(None, BillingInterval::from_str_opt("weekly"));
    }
}
