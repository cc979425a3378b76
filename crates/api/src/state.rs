//! Application state.

use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::JwtManager;
use crate::config::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Billing service; `None` when Stripe is not configured, in which
    /// case billing endpoints answer 503 and everything else still works.
    pub billing: Option<Arc<cove_billing::BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);

        let billing = match cove_billing::BillingService::from_env(pool.clone()) {
            Ok(svc) => {
                tracing::info!("Stripe billing service initialized");
                Some(Arc::new(svc))
            }
            Err(e) => {
                tracing::warn!("Stripe billing not configured: {}", e);
                None
            }
        };

        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }
}
