//! Shared types and database helpers used across Cove services.
//!
//! Kept separate from the billing crate so the API server can talk about
//! plan tiers and subscription status without pulling in the Stripe stack.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{BillingInterval, PlanTier, SubscriptionStatus};
