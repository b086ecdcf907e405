//! Standalone claim expiration resolver process: wires concrete Postgres and
//! HTTP adapters to the core algorithm and runs until a shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use resolver_core::{NoOpDependencyTracker, NoOpEventPublisher, ResolverConfig};
use resolver_db::{connect, PostgresAdvisoryQueue, PostgresPendingQueue, PostgresTaskStore};
use resolver_notify::{init_tracing, HttpDependencyTracker, TracingTelemetry, WebhookEventPublisher};
use resolver_worker::{DriverConfig, HandlerContext, IterationDriver};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ResolverConfig::from_env()?;
    tracing::info!(
        parallelism = config.parallelism,
        batch_size = config.batch_size,
        "claim resolver starting"
    );

    let pool = connect(&config.database_url, config.db_pool_size).await?;

    let task_store = Arc::new(PostgresTaskStore::new(pool.clone(), config.max_cas_attempts));
    let advisory_queue = Arc::new(PostgresAdvisoryQueue::new(
        pool.clone(),
        config.visibility_timeout,
    ));
    let pending_queue = Arc::new(PostgresPendingQueue::new(pool.clone()));

    let event_publisher: Arc<dyn resolver_core::EventPublisher> =
        match (&config.webhook_url, &config.webhook_signing_secret) {
            (Some(url), Some(secret)) => {
                Arc::new(WebhookEventPublisher::new(url.clone(), secret.clone()))
            }
            _ => {
                tracing::warn!("no webhook configured; notifications will be dropped");
                Arc::new(NoOpEventPublisher)
            }
        };

    let dependency_tracker: Arc<dyn resolver_core::DependencyTracker> = match &config.webhook_url {
        Some(url) => Arc::new(HttpDependencyTracker::new(url.clone())),
        None => Arc::new(NoOpDependencyTracker),
    };

    let telemetry: Arc<dyn resolver_core::Telemetry> = Arc::new(TracingTelemetry);

    let ctx = HandlerContext {
        task_store,
        advisory_queue,
        pending_queue,
        event_publisher,
        dependency_tracker,
        telemetry,
    };

    let driver = Arc::new(IterationDriver::new(
        ctx,
        DriverConfig {
            polling_delay: config.poll_interval,
            parallelism: config.parallelism,
            batch_size: config.batch_size,
            max_iteration_time: Duration::from_secs(600),
            max_failures: config.max_consecutive_failures,
        },
    ));

    driver.start().await;

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining current iteration");
    driver.terminate().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
