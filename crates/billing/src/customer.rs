//! Billing customer management.
//!
//! One provider customer per organization, created lazily on the first
//! checkout or portal request and persisted on the subscription record.

use sqlx::PgPool;
use stripe::{CreateCustomer, Customer};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStore;

pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
    store: SubscriptionStore,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        Self {
            stripe,
            pool,
            store,
        }
    }

    /// The stored provider customer id, if the organization has one.
    pub async fn get_customer_id(&self, org_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self
            .store
            .get(org_id)
            .await?
            .and_then(|r| r.provider_customer_id))
    }

    /// Get the organization's provider customer id, creating the customer
    /// at the provider on first use.
    pub async fn get_or_create(&self, org_id: Uuid, email: &str) -> BillingResult<String> {
        if let Some(existing) = self.get_customer_id(org_id).await? {
            return Ok(existing);
        }

        let org_name: Option<(String,)> =
            sqlx::query_as("SELECT name FROM organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;
        let org_name = org_name
            .map(|(n,)| n)
            .ok_or_else(|| BillingError::Internal(format!("Organization {} not found", org_id)))?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());

        let mut params = CreateCustomer::new();
        params.name = Some(&org_name);
        if !email.is_empty() {
            params.email = Some(email);
        }
        params.metadata = Some(metadata);

        let customer = Customer::create(self.stripe.inner(), params).await?;
        let customer_id = customer.id.to_string();

        self.store
            .set_provider_customer(org_id, &customer_id)
            .await?;

        tracing::info!(
            org_id = %org_id,
            customer_id = %customer_id,
            "Created billing customer"
        );

        Ok(customer_id)
    }
}
