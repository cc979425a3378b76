//! Bearer-token authentication.
//!
//! Billing endpoints act on the organization carried in the session token.
//! Webhook ingestion does not come through here; provider events are
//! correlated by the organization id in event metadata, never by
//! request-scoped identity.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub org_id: Option<Uuid>,
    pub email: Option<String>,
    pub exp: i64,
}

/// Authenticated request context, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub org_id: Option<Uuid>,
    pub email: Option<String>,
}

#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token verification failed");
                ApiError::Unauthorized
            })
    }
}

/// Require a valid bearer token and attach [`AuthUser`] to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = state.jwt_manager.verify(token)?;

    req.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        org_id: claims.org_id,
        email: claims.email,
    });

    Ok(next.run(req).await)
}
