use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lendq_core::QueueName;
use lendq_infra::jobs::HealthService;
use lendq_infra::{JobSystem, MIGRATOR};
use lendq_worker::WorkerProcessConfig;

/// How long background loops get to finish after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerProcessConfig::from_env().context("invalid worker configuration")?;
    lendq_observability::init_with(config.log_format, "info");

    info!(
        database_url = %config.database_url_masked(),
        queues = ?config.queues.iter().map(QueueName::as_str).collect::<Vec<_>>(),
        max_connections = config.db_max_connections,
        environment = %config.instance.environment,
        server_instance = %config.instance.server_instance,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    MIGRATOR.run(&pool).await.context("failed to run database migrations")?;
    info!("database migrations completed");

    let system = JobSystem::postgres(pool.clone(), config.instance.clone());
    let cancel = CancellationToken::new();

    let maintenance = system
        .maintenance(config.queues.clone(), config.maintenance.clone())
        .spawn(cancel.clone());
    let health = tokio::spawn(report_health(
        system.health(config.queues.clone()),
        config.health_interval,
        cancel.clone(),
    ));

    shutdown_signal().await;
    info!("shutdown signal received, stopping background loops");
    cancel.cancel();

    let stopped = tokio::time::timeout(SHUTDOWN_GRACE, async {
        if let Err(e) = maintenance.await {
            error!(error = %e, "maintenance task failed");
        }
        if let Err(e) = health.await {
            error!(error = %e, "health task failed");
        }
    })
    .await;
    if stopped.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "shutdown grace period expired");
    }

    pool.close().await;
    info!("lendq worker shutdown complete");
    Ok(())
}

async fn create_database_pool(config: &WorkerProcessConfig) -> Result<PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                info!("database connection pool established");
                return Ok(pool);
            }
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(attempt = retries, max_retries = MAX_RETRIES, error = %e, "database connection failed, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => return Err(e).context("failed to create database connection pool after retries"),
        }
    }
}

/// Log a health report every `interval` until cancelled.
async fn report_health(health: HealthService, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = health.report().await;
                let body = match serde_json::to_string(&report) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize health report");
                        continue;
                    }
                };
                let alerting = report.alerting_queues();
                if report.healthy && alerting.is_empty() {
                    info!(report = %body, "health report");
                } else {
                    warn!(healthy = report.healthy, alerting = ?alerting, report = %body, "health report");
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
