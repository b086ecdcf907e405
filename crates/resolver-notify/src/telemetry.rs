use async_trait::async_trait;
use resolver_core::Telemetry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the process-wide `tracing` subscriber: `EnvFilter`-driven,
/// compact console format, matching every other service binary in this
/// codebase's non-OpenTelemetry init path.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "resolver=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Structured logging over `tracing`, matching this codebase's plain
/// console-subscriber initialization. Fatal alerts are logged at `error`
/// level with an `alert = true` field so they're easy to grep or route to an
/// external paging integration later.
pub struct TracingTelemetry;

#[async_trait]
impl Telemetry for TracingTelemetry {
    fn log_info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn log_warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn report_error(&self, error: &anyhow::Error) {
        tracing::error!(error = %error, "resolver error");
    }

    async fn alert_fatal(&self, message: &str) {
        tracing::error!(alert = true, "{message}");
    }
}
