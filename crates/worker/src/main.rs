//! NovaVid Background Worker
//!
//! Handles scheduled ledger maintenance:
//! - Stale reservation sweep (every 5 minutes)
//! - Parked webhook event retry (every minute)
//! - Invariant checks with enforcement (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use novavid_ledger::{LedgerService, PgLedgerStore};
use novavid_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

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

    info!("Starting NovaVid Worker");

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let ledger = Arc::new(LedgerService::<PgLedgerStore>::from_env(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Refund reservations past their TTL (every 5 minutes)
    let sweeper = ledger.sweeper.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                match sweeper.refund_stale().await {
                    Ok(report) if report.examined > 0 => info!(
                        examined = report.examined,
                        refunded = report.refunded,
                        skipped = report.skipped,
                        "Reservation sweep complete"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Reservation sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale reservation sweep (every 5 minutes)");

    // Job 2: Retry parked webhook events (every minute)
    let reconciler = ledger.reconciler.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let reconciler = reconciler.clone();
            Box::pin(async move {
                match reconciler.retry_parked(100).await {
                    Ok(report) if report.retried > 0 => info!(
                        retried = report.retried,
                        applied = report.applied,
                        still_parked = report.still_parked,
                        dropped = report.dropped,
                        "Parked event retry complete"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Parked event retry failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Parked event retry (every minute)");

    // Job 3: Invariant checks with enforcement (daily at 3:00 AM UTC)
    let invariants = ledger.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let invariants = invariants.clone();
            Box::pin(async move {
                match invariants.run_and_enforce().await {
                    Ok(summary) => info!(
                        checks_run = summary.checks_run,
                        checks_failed = summary.checks_failed,
                        violations = summary.violations.len(),
                        healthy = summary.healthy,
                        "Invariant check complete"
                    ),
                    Err(e) => error!(error = %e, "Invariant check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks (daily at 3:00 AM UTC)");

    // Job 4: Health check heartbeat (every 5 minutes)
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

    info!("NovaVid Worker started successfully with 4 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background
    // tasks.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
