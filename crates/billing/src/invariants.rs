//! Billing invariant checks.
//!
//! Runnable consistency checks over the persisted subscription records.
//! The reconciler maintains these invariants on every transition; the
//! checker audits the database for drift after incidents, migrations, or
//! webhook replays. Checks only read, never write.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::PROCESSING_TIMEOUT_MINUTES;

/// Result of running a single invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Organization(s) affected.
    pub org_ids: Vec<Uuid>,
    /// Human-readable description of the violation.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access gating may be wrong right now.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, should investigate.
    Medium,
    /// Minor inconsistency, informational.
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    org_id: Uuid,
    plan: String,
    status: String,
    failed_payment_count: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckEventRow {
    provider_event_id: String,
    event_type: String,
    processing_started_at: OffsetDateTime,
}

/// Service for running billing invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_dunning_implies_past_due().await?);
        violations.extend(self.check_canceled_is_free().await?);
        violations.extend(self.check_pending_only_in_good_standing().await?);
        violations.extend(self.check_plan_resolves_in_catalog().await?);
        violations.extend(self.check_paid_plan_has_provider_ids().await?);
        violations.extend(self.check_no_stuck_webhook_events().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single named check.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "dunning_implies_past_due" => self.check_dunning_implies_past_due().await,
            "canceled_is_free" => self.check_canceled_is_free().await,
            "pending_only_in_good_standing" => self.check_pending_only_in_good_standing().await,
            "plan_resolves_in_catalog" => self.check_plan_resolves_in_catalog().await,
            "paid_plan_has_provider_ids" => self.check_paid_plan_has_provider_ids().await,
            "no_stuck_webhook_events" => self.check_no_stuck_webhook_events().await,
            _ => Err(BillingError::InvalidInput(format!(
                "unknown invariant check: {}",
                name
            ))),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "dunning_implies_past_due",
            "canceled_is_free",
            "pending_only_in_good_standing",
            "plan_resolves_in_catalog",
            "paid_plan_has_provider_ids",
            "no_stuck_webhook_events",
        ]
    }

    /// A dunning counter above zero implies past_due status and a grace
    /// deadline. Anything else means feature gating is looking at a record
    /// that cannot have happened.
    async fn check_dunning_implies_past_due(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT org_id, plan, status, failed_payment_count
            FROM subscriptions
            WHERE failed_payment_count > 0
              AND (status != 'past_due' OR grace_period_end IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "dunning_implies_past_due".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Record has {} failed payments but status '{}' or no grace deadline",
                    row.failed_payment_count, row.status
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "failed_payment_count": row.failed_payment_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Canceled records are free-plan records with no residual flags.
    async fn check_canceled_is_free(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT org_id, plan, status, failed_payment_count
            FROM subscriptions
            WHERE status = 'canceled'
              AND (plan != 'free' OR cancel_at_period_end OR grace_period_end IS NOT NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_is_free".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Canceled record still carries plan '{}' or residual cancellation/grace flags",
                    row.plan
                ),
                context: serde_json::json!({ "plan": row.plan }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A scheduled plan change is only meaningful while the subscription
    /// is active or trialing.
    async fn check_pending_only_in_good_standing(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT org_id, plan, status, failed_payment_count
            FROM subscriptions
            WHERE pending_plan IS NOT NULL
              AND status NOT IN ('active', 'trialing')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_only_in_good_standing".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Record in status '{}' still carries a pending plan change",
                    row.status
                ),
                context: serde_json::json!({ "status": row.status }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Every stored plan string must correspond to a catalog tier.
    async fn check_plan_resolves_in_catalog(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT org_id, plan, status, failed_payment_count
            FROM subscriptions
            WHERE plan NOT IN ('free', 'standard', 'plus', 'business')
               OR (pending_plan IS NOT NULL
                   AND pending_plan NOT IN ('free', 'standard', 'plus', 'business'))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "plan_resolves_in_catalog".to_string(),
                org_ids: vec![row.org_id],
                description: format!("Record carries unknown plan '{}'", row.plan),
                context: serde_json::json!({ "plan": row.plan }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Paid records in good standing should know their provider ids;
    /// without them inbound events cannot correlate.
    async fn check_paid_plan_has_provider_ids(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT org_id, plan, status, failed_payment_count
            FROM subscriptions
            WHERE plan != 'free'
              AND status IN ('active', 'trialing')
              AND (provider_subscription_id IS NULL OR provider_customer_id IS NULL)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_plan_has_provider_ids".to_string(),
                org_ids: vec![row.org_id],
                description: format!(
                    "Paid record on plan '{}' is missing provider identifiers",
                    row.plan
                ),
                context: serde_json::json!({ "plan": row.plan, "status": row.status }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Webhook events stuck in `processing` past the claim timeout. The
    /// worker's recovery sweep releases these; seeing them here repeatedly
    /// means processing is crashing.
    async fn check_no_stuck_webhook_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckEventRow> = sqlx::query_as(
            r#"
            SELECT provider_event_id, event_type, processing_started_at
            FROM billing_webhook_events
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - ($1 || ' minutes')::INTERVAL
            "#,
        )
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_events".to_string(),
                org_ids: vec![],
                description: format!(
                    "Event {} ({}) stuck in processing since {}",
                    row.provider_event_id, row.event_type, row.processing_started_at
                ),
                context: serde_json::json!({
                    "event_type": row.event_type,
                    "processing_started_at": row.processing_started_at.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display() {
        assert_eq!("CRITICAL", ViolationSeverity::Critical.to_string());
        assert_eq!("LOW", ViolationSeverity::Low.to_string());
    }

    #[test]
    fn run_check_names_match_available_checks() {
        // Every advertised check name must be routable.
        let names = InvariantChecker::available_checks();
        assert_eq!(6, names.len());
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(names.len(), unique.len());
    }
}
