//! API error type and HTTP status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cove_billing::BillingError;

/// Errors surfaced by API handlers.
///
/// Every variant renders as a single human-readable message; provider and
/// database detail stays in the logs.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("No organization in session")]
    NoOrganization,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Billing is not configured")]
    ServiceUnavailable,

    /// Transient provider failure; the user can retry.
    #[error("{0}")]
    Upstream(String),

    #[error("Internal error")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NoOrganization => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal detail is logged, not returned.
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "Internal API error");
                "Internal error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::NoCustomer(_) | BillingError::SubscriptionNotFound(_) => {
                ApiError::NotFound("No subscription found for this organization".to_string())
            }
            BillingError::InvalidTier(msg)
            | BillingError::InvalidInput(msg)
            | BillingError::UseCheckoutFlow(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::StripeApi(detail) => {
                tracing::error!(detail = %detail, "Billing provider call failed");
                ApiError::Upstream(
                    "The billing provider could not be reached; please try again".to_string(),
                )
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
