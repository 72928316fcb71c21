//! Atende Background Worker
//!
//! Handles scheduled billing jobs:
//! - Billing period rollover + scheduled cancellations (every 15 minutes)
//! - Trial expiry sweep (hourly)
//! - Overdue invoice marking (daily at 2:10 UTC)
//! - Billing invariant check (daily at 3:20 UTC)
//! - Health check heartbeat (every 5 minutes)
//!
//! Payment collection is NOT driven here: the payment processor is an
//! external collaborator that settles pending invoices and reports back
//! through `PaymentCallbacks`.

use std::sync::Arc;
use std::time::Duration;

use atende_billing::{AdvancedPeriod, BillingService, Clock};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
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

/// Log the outcome of a rollover sweep
fn log_rollover_results(advanced: &[AdvancedPeriod]) {
    let cancelled = advanced.iter().filter(|a| a.cancelled).count();
    let plan_changes = advanced
        .iter()
        .filter(|a| a.plan_changed_to.is_some())
        .count();

    info!(
        rolled = advanced.len(),
        cancellations_executed = cancelled,
        scheduled_plan_changes = plan_changes,
        "Rollover sweep complete"
    );
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

    info!("Starting Atende Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service and seed the catalog on first boot
    let billing = Arc::new(BillingService::from_env(pool.clone()));
    if let Err(e) = billing.catalog.seed_builtin().await {
        warn!(error = %e, "Catalog seeding failed - continuing with existing catalog");
    }

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Billing period rollover sweep (every 15 minutes)
    // Advances due periods, executes scheduled cancellations/downgrades,
    // and generates period invoices
    let rollover_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = rollover_billing.clone();
            Box::pin(async move {
                info!("Running billing period rollover sweep");
                match billing
                    .process_due_rollovers(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(advanced) => log_rollover_results(&advanced),
                    Err(e) => error!(error = %e, "Rollover sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing period rollover sweep (every 15 minutes)");

    // Job 2: Trial expiry sweep (hourly at :05)
    let trial_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let billing = trial_billing.clone();
            Box::pin(async move {
                info!("Running trial expiry sweep");
                match billing
                    .subscriptions
                    .process_expired_trials(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(converted) if converted.is_empty() => {
                        info!("No trials expired");
                    }
                    Ok(converted) => {
                        info!(converted = converted.len(), "Trials converted to active");
                    }
                    Err(e) => error!(error = %e, "Trial expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry sweep (hourly)");

    // Job 3: Overdue invoice marking (daily at 2:10 UTC)
    let overdue_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 10 2 * * *", move |_uuid, _l| {
            let billing = overdue_billing.clone();
            Box::pin(async move {
                info!("Running overdue invoice sweep");
                match billing
                    .invoices
                    .mark_overdue(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(overdue) if overdue.is_empty() => {
                        info!("No invoices became overdue");
                    }
                    Ok(overdue) => {
                        warn!(count = overdue.len(), "Invoices marked overdue");
                    }
                    Err(e) => error!(error = %e, "Overdue invoice sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Overdue invoice marking (daily at 2:10 UTC)");

    // Job 4: Billing invariant check (daily at 3:20 UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 20 3 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                let checker = billing.invariant_checker(Clock::system());
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "All billing invariants hold"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                context = %violation.context,
                                "Billing invariant violation"
                            );
                        }
                        error!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Billing invariant check found violations"
                        );
                    }
                    Err(e) => error!(error = %e, "Invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant check (daily at 3:20 UTC)");

    // Job 5: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Atende Worker started successfully with {} scheduled jobs", 5);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
