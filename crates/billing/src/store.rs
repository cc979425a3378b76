//! Persistence for subscription records.
//!
//! One row per organization, upserted on `org_id`. Event application is a
//! read-modify-write inside a single transaction: `get_for_update` takes a
//! row lock so concurrent events for the same organization serialize (a
//! failed-payment increment can never lose a race with an invoice-paid
//! reset), while events for different organizations proceed in parallel.
//! The upsert keyed on `org_id` makes replaying an event after a crash
//! mid-write safe.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use cove_shared::{BillingInterval, PlanTier, SubscriptionStatus};

use crate::error::BillingResult;
use crate::reconcile::SubscriptionRecord;

const RECORD_COLUMNS: &str = r#"
    org_id, provider_customer_id, provider_subscription_id,
    plan, billing_interval, status,
    current_period_start, current_period_end, cancel_at_period_end,
    pending_plan, pending_interval,
    failed_payment_count, grace_period_end, last_payment_error
"#;

impl sqlx::FromRow<'_, PgRow> for SubscriptionRecord {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        // Plan and status columns are free text in the database; anything
        // unparseable resolves to the free plan rather than granting access.
        let plan: String = row.try_get("plan")?;
        let interval: String = row.try_get("billing_interval")?;
        let status: String = row.try_get("status")?;

        Ok(Self {
            org_id: row.try_get("org_id")?,
            provider_customer_id: row.try_get("provider_customer_id")?,
            provider_subscription_id: row.try_get("provider_subscription_id")?,
            plan: plan.parse().unwrap_or(PlanTier::Free),
            interval: BillingInterval::from_str_opt(&interval).unwrap_or_default(),
            status: status.parse().unwrap_or(SubscriptionStatus::Canceled),
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            pending_plan: row
                .try_get::<Option<String>, _>("pending_plan")?
                .and_then(|p| p.parse().ok()),
            pending_interval: row
                .try_get::<Option<String>, _>("pending_interval")?
                .as_deref()
                .and_then(BillingInterval::from_str_opt),
            failed_payment_count: row.try_get("failed_payment_count")?,
            grace_period_end: row.try_get("grace_period_end")?,
            last_payment_error: row.try_get("last_payment_error")?,
        })
    }
}

/// Keyed upsert/read interface over the subscriptions table.
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin(&self) -> BillingResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Read the record for an organization, if one exists.
    pub async fn get(&self, org_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM subscriptions WHERE org_id = $1"
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Read the record inside a transaction, locking the row for the rest
    /// of the transaction.
    pub async fn get_for_update(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        org_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM subscriptions WHERE org_id = $1 FOR UPDATE"
        ))
        .bind(org_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(record)
    }

    /// Secondary addressing: find the owning organization of a provider
    /// subscription id (inbound event correlation).
    pub async fn org_for_provider_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT org_id FROM subscriptions WHERE provider_subscription_id = $1")
                .bind(provider_subscription_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Secondary addressing: find the owning organization of a provider
    /// customer id.
    pub async fn org_for_provider_customer(
        &self,
        provider_customer_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT org_id FROM subscriptions WHERE provider_customer_id = $1")
                .bind(provider_customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Upsert a record inside a transaction.
    pub async fn upsert_in_tx(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        record: &SubscriptionRecord,
    ) -> BillingResult<()> {
        sqlx::query(UPSERT_SQL)
            .bind(Uuid::new_v4())
            .bind(record.org_id)
            .bind(&record.provider_customer_id)
            .bind(&record.provider_subscription_id)
            .bind(record.plan.as_str())
            .bind(record.interval.as_str())
            .bind(record.status.as_str())
            .bind(record.current_period_start)
            .bind(record.current_period_end)
            .bind(record.cancel_at_period_end)
            .bind(record.pending_plan.map(|p| p.as_str()))
            .bind(record.pending_interval.map(|i| i.as_str()))
            .bind(record.failed_payment_count)
            .bind(record.grace_period_end)
            .bind(&record.last_payment_error)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Upsert a record outside a transaction (session-orchestration path).
    pub async fn upsert(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        sqlx::query(UPSERT_SQL)
            .bind(Uuid::new_v4())
            .bind(record.org_id)
            .bind(&record.provider_customer_id)
            .bind(&record.provider_subscription_id)
            .bind(record.plan.as_str())
            .bind(record.interval.as_str())
            .bind(record.status.as_str())
            .bind(record.current_period_start)
            .bind(record.current_period_end)
            .bind(record.cancel_at_period_end)
            .bind(record.pending_plan.map(|p| p.as_str()))
            .bind(record.pending_interval.map(|i| i.as_str()))
            .bind(record.failed_payment_count)
            .bind(record.grace_period_end)
            .bind(&record.last_payment_error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the provider customer id for an organization without
    /// touching the rest of the record.
    pub async fn set_provider_customer(
        &self,
        org_id: Uuid,
        provider_customer_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, org_id, provider_customer_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (org_id) DO UPDATE SET
                provider_customer_id = EXCLUDED.provider_customer_id,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(provider_customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ON CONFLICT (org_id): there is one record per organization, and a new
// subscription after a canceled one arrives with a new provider id.
const UPSERT_SQL: &str = r#"
    INSERT INTO subscriptions (
        id, org_id, provider_customer_id, provider_subscription_id,
        plan, billing_interval, status,
        current_period_start, current_period_end, cancel_at_period_end,
        pending_plan, pending_interval,
        failed_payment_count, grace_period_end, last_payment_error,
        created_at, updated_at
    ) VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW(), NOW()
    )
    ON CONFLICT (org_id) DO UPDATE SET
        provider_customer_id = EXCLUDED.provider_customer_id,
        provider_subscription_id = EXCLUDED.provider_subscription_id,
        plan = EXCLUDED.plan,
        billing_interval = EXCLUDED.billing_interval,
        status = EXCLUDED.status,
        current_period_start = EXCLUDED.current_period_start,
        current_period_end = EXCLUDED.current_period_end,
        cancel_at_period_end = EXCLUDED.cancel_at_period_end,
        pending_plan = EXCLUDED.pending_plan,
        pending_interval = EXCLUDED.pending_interval,
        failed_payment_count = EXCLUDED.failed_payment_count,
        grace_period_end = EXCLUDED.grace_period_end,
        last_payment_error = EXCLUDED.last_payment_error,
        updated_at = NOW()
"#;
