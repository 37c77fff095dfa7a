//! Paybridge Background Worker
//!
//! Composition root for the billing engine and its scheduled maintenance jobs:
//! - Stale webhook reprocessing (every minute)
//! - Failed webhook replay (every 15 minutes)
//! - Ledger invariant checks (hourly)
//! - Processed webhook retention cleanup (daily at 3:00 AM UTC)
//! - In-memory rate limit window cleanup (every 5 minutes)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use paybridge_billing::{BillingConfig, BillingService, PgLedger, ViolationSeverity};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,paybridge_billing=debug"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let config = BillingConfig::from_env()?;
    init_tracing(config.json_logs);

    info!(environment = %config.environment, "Starting Paybridge Worker");

    let pool = create_db_pool(&config.database_url).await?;
    PgLedger::new(pool.clone()).run_migrations().await?;

    let billing = Arc::new(BillingService::from_config(&config, pool).await?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reprocess webhook events whose claim was abandoned
    let stale_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = stale_billing.clone();
            Box::pin(async move {
                match billing.webhooks.reprocess_stale(None).await {
                    Ok(results) => {
                        let failed = results.iter().filter(|r| !r.success).count();
                        if failed > 0 {
                            warn!(
                                reprocessed = results.len(),
                                failed, "Stale webhook reprocessing finished with failures"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Stale webhook reprocessing failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale webhook reprocessing (every minute)");

    // Job 2: Replay events that were processed with an error
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                info!("Running failed webhook replay");
                match billing.webhooks.replay_failed(None).await {
                    Ok(results) => {
                        let recovered = results.iter().filter(|r| r.success).count();
                        info!(
                            replayed = results.len(),
                            recovered,
                            still_failing = results.len() - recovered,
                            "Failed webhook replay complete"
                        );
                    }
                    Err(e) => error!(error = %e, "Failed webhook replay errored"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failed webhook replay (every 15 minutes)");

    // Job 3: Ledger invariant checks (hourly)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks = summary.checks_run, "Ledger invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            if violation.severity == ViolationSeverity::Critical {
                                error!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    entities = ?violation.entity_ids,
                                    "{}", violation.description
                                );
                            } else {
                                warn!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    entities = ?violation.entity_ids,
                                    "{}", violation.description
                                );
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Ledger invariant check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (hourly)");

    // Job 4: Delete processed webhooks past retention (daily at 3:00 AM UTC)
    let cleanup_billing = billing.clone();
    let retention = Duration::from_secs(
        u64::try_from(config.webhook_retention_days.max(1)).unwrap_or(30) * 24 * 60 * 60,
    );
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                info!("Running webhook retention cleanup");
                if let Err(e) = billing.webhooks.cleanup(retention).await {
                    error!(error = %e, "Webhook retention cleanup failed");
                }
            })
        })?)
        .await?;
    info!(
        retention_days = config.webhook_retention_days,
        "Scheduled: Webhook retention cleanup (daily at 3:00 AM)"
    );

    // Job 5: Rate limiter cleanup and heartbeat (every 5 minutes)
    let heartbeat_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = heartbeat_billing.clone();
            Box::pin(async move {
                billing.rate_limiter.cleanup().await;
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Rate limit cleanup and heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Paybridge Worker started successfully with {} scheduled jobs", 5);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
