//! Stripe client and configuration.

use std::sync::Arc;

use cove_shared::{BillingInterval, PlanTier};

use crate::error::{BillingError, BillingResult};

/// Provider price ids for each paid tier and interval.
///
/// Loaded from the environment at startup; the catalog is built from these
/// and is not user-mutable at runtime.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub standard_monthly: String,
    pub standard_yearly: String,
    pub plus_monthly: String,
    pub plus_yearly: String,
    pub business_monthly: String,
    pub business_yearly: String,
}

impl PriceIds {
    pub fn lookup(&self, tier: PlanTier, interval: BillingInterval) -> Option<&str> {
        match (tier, interval) {
            (PlanTier::Standard, BillingInterval::Monthly) => Some(&self.standard_monthly),
            (PlanTier::Standard, BillingInterval::Yearly) => Some(&self.standard_yearly),
            (PlanTier::Plus, BillingInterval::Monthly) => Some(&self.plus_monthly),
            (PlanTier::Plus, BillingInterval::Yearly) => Some(&self.plus_yearly),
            (PlanTier::Business, BillingInterval::Monthly) => Some(&self.business_monthly),
            (PlanTier::Business, BillingInterval::Yearly) => Some(&self.business_yearly),
            (PlanTier::Free, _) => None,
        }
    }
}

/// Stripe configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    /// Base URL of the web app; checkout and portal sessions redirect here.
    pub app_base_url: String,
}

fn require_env(name: &str) -> BillingResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BillingError::Config(format!("{} must be set", name)))
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: require_env("STRIPE_SECRET_KEY")?,
            webhook_secret: require_env("STRIPE_WEBHOOK_SECRET")?,
            price_ids: PriceIds {
                standard_monthly: require_env("STRIPE_PRICE_STANDARD_MONTHLY")?,
                standard_yearly: require_env("STRIPE_PRICE_STANDARD_YEARLY")?,
                plus_monthly: require_env("STRIPE_PRICE_PLUS_MONTHLY")?,
                plus_yearly: require_env("STRIPE_PRICE_PLUS_YEARLY")?,
                business_monthly: require_env("STRIPE_PRICE_BUSINESS_MONTHLY")?,
                business_yearly: require_env("STRIPE_PRICE_BUSINESS_YEARLY")?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    pub fn price_id_for(&self, tier: PlanTier, interval: BillingInterval) -> Option<&str> {
        self.price_ids.lookup(tier, interval)
    }
}

/// Thin wrapper around the Stripe SDK client carrying our configuration.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying SDK client.
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
