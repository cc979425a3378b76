//! Cove Background Worker
//!
//! Handles scheduled billing jobs:
//! - Billing invariant audit (hourly)
//! - Stuck webhook event recovery (every 15 minutes)
//! - Health check heartbeat (every 5 minutes)

use std::time::Duration;

use cove_billing::{InvariantChecker, ViolationSeverity};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool.
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Cove Worker");

    let pool = create_db_pool().await?;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing invariant audit (hourly at :10)
    // Log-only: violations mean the reconciler and the database disagree
    // and someone should look before anything self-heals wrongly.
    let audit_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let pool = audit_pool.clone();
            Box::pin(async move {
                info!("Running billing invariant audit");
                let checker = InvariantChecker::new(pool);
                match checker.run_all_checks().await {
                    Ok(summary) => {
                        info!(
                            checks_run = summary.checks_run,
                            checks_passed = summary.checks_passed,
                            violations = summary.violations.len(),
                            healthy = summary.healthy,
                            "Invariant audit complete"
                        );
                        for violation in &summary.violations {
                            match violation.severity {
                                ViolationSeverity::Critical | ViolationSeverity::High => {
                                    error!(
                                        invariant = %violation.invariant,
                                        severity = %violation.severity,
                                        org_ids = ?violation.org_ids,
                                        description = %violation.description,
                                        "Billing invariant violated"
                                    );
                                }
                                _ => {
                                    warn!(
                                        invariant = %violation.invariant,
                                        severity = %violation.severity,
                                        description = %violation.description,
                                        "Billing invariant violated"
                                    );
                                }
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant audit failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant audit (hourly)");

    // Job 2: Release webhook events stuck in 'processing' (every 15 minutes)
    // A crash between claim and completion leaves the claim row open; the
    // handler re-claims on the provider's next retry, but once the provider
    // gives up retrying the row would sit forever. Marking it 'error' keeps
    // the audit trail honest and the stuck-event invariant quiet.
    let recovery_pool = pool.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let pool = recovery_pool.clone();
            Box::pin(async move {
                let released = sqlx::query(
                    r#"
                    UPDATE billing_webhook_events
                    SET processing_result = 'error',
                        error_message = 'Released by worker recovery sweep'
                    WHERE processing_result = 'processing'
                      AND processing_started_at < NOW() - INTERVAL '30 minutes'
                    "#,
                )
                .execute(&pool)
                .await;

                match released {
                    Ok(result) if result.rows_affected() > 0 => {
                        warn!(
                            released = result.rows_affected(),
                            "Released webhook events stuck in processing"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Stuck webhook recovery sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stuck webhook event recovery (every 15 minutes)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Cove Worker started successfully with 3 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
