//! Billing endpoints: webhook ingestion, session creation, plan changes.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use cove_billing::policy;
use cove_shared::{BillingInterval, PlanTier};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub tier: String,
    pub interval: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutSessionResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortalSessionResponse {
    pub portal_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleChangeRequest {
    pub tier: String,
    pub interval: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ScheduleChangeResponse {
    pub current_plan: String,
    pub new_plan: String,
    pub new_interval: String,
    pub effective_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UndoChangeResponse {
    pub cleared: bool,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub plan: String,
    pub interval: String,
    pub status: String,
    pub current_period_end: Option<String>,
    pub cancel_at_period_end: bool,
    pub pending_plan: Option<String>,
    pub pending_interval: Option<String>,
    pub failed_payment_count: i32,
    pub grace_period_end: Option<String>,
    /// True once the grace period after failed payments has elapsed.
    pub access_restricted: bool,
}

/// Provider webhook endpoint.
///
/// 200 for processed or safely-ignored events, 400 for verification
/// failures, 500 when reconciliation fails so the provider retries.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request missing signature header");
            ApiError::BadRequest("Missing signature header".to_string())
        })?;

    let event = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = ?e, "Webhook signature verification failed");
        ApiError::BadRequest("Invalid webhook signature".to_string())
    })?;

    billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(error = %e, "Webhook handling failed");
        ApiError::Internal(format!("Webhook handling failed: {}", e))
    })?;

    Ok(StatusCode::OK)
}

/// Create a hosted checkout session for a paid plan.
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateCheckoutRequest>,
) -> Result<Json<CheckoutSessionResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let tier = parse_tier(&req.tier)?;
    if !tier.is_paid() {
        return Err(ApiError::BadRequest(
            "The free plan does not require checkout".to_string(),
        ));
    }
    let interval = parse_interval(req.interval.as_deref())?;

    let email = auth_user.email.as_deref().unwrap_or("");
    let customer_id = billing.customer.get_or_create(org_id, email).await?;

    let session = billing
        .checkout
        .create_plan_checkout(org_id, &customer_id, tier, interval)
        .await?;

    Ok(Json(CheckoutSessionResponse {
        session_id: session.session_id,
        url: session.url,
    }))
}

/// Create a provider-hosted self-service management session.
pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<PortalSessionResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    // Managing billing requires an existing provider customer; surfacing
    // this as "no subscription" beats a confusing provider error.
    let customer_id = billing
        .customer
        .get_customer_id(org_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("No subscription to manage".to_string()))?;

    let session = billing
        .portal
        .create_portal_session(org_id, &customer_id)
        .await?;

    Ok(Json(PortalSessionResponse {
        portal_url: session.portal_url,
    }))
}

/// Current subscription state for the caller's organization.
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<SubscriptionInfo>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let record = billing.subscriptions.get_record(org_id).await?;
    let now = OffsetDateTime::now_utc();

    Ok(Json(SubscriptionInfo {
        plan: record.plan.to_string(),
        interval: record.interval.to_string(),
        status: record.status.to_string(),
        current_period_end: record.current_period_end.map(format_rfc3339),
        cancel_at_period_end: record.cancel_at_period_end,
        pending_plan: record.pending_plan.map(|p| p.to_string()),
        pending_interval: record.pending_interval.map(|i| i.to_string()),
        failed_payment_count: record.failed_payment_count,
        grace_period_end: record.grace_period_end.map(format_rfc3339),
        access_restricted: policy::is_access_restricted(&record, now),
    }))
}

/// Schedule a downgrade or interval switch for the end of the period.
pub async fn schedule_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ScheduleChangeRequest>,
) -> Result<Json<ScheduleChangeResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let tier = parse_tier(&req.tier)?;
    let interval = parse_interval(req.interval.as_deref())?;

    let change = billing
        .subscriptions
        .schedule_plan_change(org_id, tier, interval)
        .await?;

    // Confirmation e-mail is best-effort.
    if let Some(email) = auth_user.email.as_deref() {
        if let Err(e) = billing
            .email
            .send_change_scheduled(
                email,
                &org_name(&state, org_id).await,
                &change.new_plan.to_string(),
                change.effective_at,
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to send change-scheduled email");
        }
    }

    Ok(Json(ScheduleChangeResponse {
        current_plan: change.current_plan.to_string(),
        new_plan: change.new_plan.to_string(),
        new_interval: change.new_interval.to_string(),
        effective_at: change.effective_at.map(format_rfc3339),
    }))
}

/// Clear any scheduled plan change. Idempotent.
pub async fn undo_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<UndoChangeResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let org_id = auth_user.org_id.ok_or(ApiError::NoOrganization)?;

    let result = billing.subscriptions.undo_scheduled_change(org_id).await?;

    Ok(Json(UndoChangeResponse {
        cleared: result.cleared,
    }))
}

fn parse_tier(raw: &str) -> Result<PlanTier, ApiError> {
    raw.parse::<PlanTier>()
        .map_err(|_| ApiError::BadRequest(format!("Unknown plan tier: {}", raw)))
}

fn parse_interval(raw: Option<&str>) -> Result<BillingInterval, ApiError> {
    match raw {
        None => Ok(BillingInterval::default()),
        Some(s) => BillingInterval::from_str_opt(s)
            .ok_or_else(|| ApiError::BadRequest(format!("Unknown billing interval: {}", s))),
    }
}

fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

async fn org_name(state: &AppState, org_id: Uuid) -> String {
    let row: Option<(String,)> = sqlx::query_as("SELECT name FROM organizations WHERE id = $1")
        .bind(org_id)
        .fetch_optional(&state.pool)
        .await
        .ok()
        .flatten();
    row.map(|(n,)| n).unwrap_or_else(|| "your workspace".to_string())
}
