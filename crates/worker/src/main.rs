//! Intervo Billing Worker
//!
//! Handles scheduled jobs including:
//! - Webhook inbox reconciliation (every minute)
//! - Billing invariant checks (hourly)
//! - Webhook inbox cleanup (daily at 3:00 AM UTC)
//! - Worker heartbeat (every 5 minutes)

mod webhook_processor;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use intervo_billing::{BillingService, InvariantCheckSummary, ViolationSeverity, MIGRATOR};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Processed inbox rows are kept this long
const WEBHOOK_RETENTION_DAYS: i64 = 7;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?,
        Err(_) => 5,
    };

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!(max_connections = max_connections, "Database pool created");
    Ok(pool)
}

/// Log results of an invariant run
fn log_invariant_results(summary: &InvariantCheckSummary) {
    info!(
        records_checked = summary.records_checked,
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Billing invariant check complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                workspace_ids = ?violation.workspace_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                workspace_ids = ?violation.workspace_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before reading RUST_LOG / LOG_FORMAT
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Intervo billing worker");

    let pool = create_db_pool().await?;

    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to apply billing migrations")?;
    info!("Billing migrations applied");

    let billing = Arc::new(
        BillingService::from_env(pool).context("Failed to configure billing service")?,
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reconcile webhook inbox (every minute)
    let inbox_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = inbox_billing.clone();
            Box::pin(async move {
                webhook_processor::process_webhook_queue(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook inbox reconciliation (every minute)");

    // Job 2: Billing invariant checks (hourly)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                match billing.invariants.run_all_checks(chrono::Utc::now()).await {
                    Ok(summary) => log_invariant_results(&summary),
                    Err(e) => error!(error = %e, "Failed to run billing invariant checks"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (hourly)");

    // Job 3: Cleanup processed webhooks (daily at 3:00 AM UTC)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                info!("Running webhook inbox cleanup");
                webhook_processor::cleanup_old_webhooks(&billing, WEBHOOK_RETENTION_DAYS).await;
            })
        })?)
        .await?;
    info!("Scheduled: Webhook inbox cleanup (daily at 3:00 AM)");

    // Job 4: Heartbeat (every 5 minutes)
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

    info!("Intervo billing worker started successfully with 4 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
