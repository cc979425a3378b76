//! Route tree.

pub mod billing;

use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    // Session-facing billing endpoints sit behind auth. The webhook route
    // is added after the auth layer so it stays outside it; the provider
    // authenticates by signature, not by session.
    let billing_routes = Router::new()
        .route("/checkout", post(billing::create_checkout))
        .route("/portal", post(billing::create_portal_session))
        .route("/subscription", get(billing::get_subscription))
        .route("/subscription/change", post(billing::schedule_change))
        .route("/subscription/undo", post(billing::undo_change))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .route("/webhook", post(billing::webhook));

    Router::new()
        .route("/health", get(health))
        .nest("/billing", billing_routes)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
