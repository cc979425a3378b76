// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries descriptive payloads
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Cove Billing Core
//!
//! Keeps locally-stored subscription state consistent with the external
//! billing provider (Stripe), which communicates exclusively through
//! asynchronous, possibly-duplicated, possibly-out-of-order webhooks.
//!
//! ## Components
//!
//! - **Plan catalog**: static ordered tier table; price-id resolution and
//!   upgrade/downgrade classification
//! - **Webhook verifier + handler**: signature verification, exactly-once
//!   event claims, typed event extraction
//! - **Reconciler**: pure transition function from (record, event) to the
//!   next record plus side effects
//! - **Grace-period policy**: dunning deadline arithmetic for feature
//!   gating callers
//! - **Session orchestration**: checkout sessions, billing portal,
//!   scheduled plan changes, undo
//! - **Invariant checker**: SQL audits of the record invariants

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod email;
pub mod error;
pub mod events;
pub mod invariants;
pub mod policy;
pub mod portal;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{PlanCatalog, PlanChange, PlanDefinition, PlanFeatures};

// Checkout
pub use checkout::{CheckoutResponse, CheckoutService};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Email
pub use email::BillingEmailService;

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, BillingEventKind, ProviderSubscriptionState};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Policy
pub use policy::{grace_deadline, is_access_restricted, GRACE_PERIOD};

// Portal
pub use portal::{PortalResponse, PortalService};

// Reconcile
pub use reconcile::{Reconciled, SideEffect, SubscriptionRecord};

// Store
pub use store::SubscriptionStore;

// Subscriptions
pub use subscriptions::{ScheduledChange, SubscriptionService, UndoResult};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality.
pub struct BillingService {
    pub checkout: CheckoutService,
    pub customer: CustomerService,
    pub email: BillingEmailService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a billing service from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::new(stripe, pool))
    }

    /// Create a billing service with an explicit client.
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let email = BillingEmailService::from_env();

        Self {
            checkout: CheckoutService::new(stripe.clone()),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            email: email.clone(),
            portal: PortalService::new(stripe.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, email),
        }
    }
}
