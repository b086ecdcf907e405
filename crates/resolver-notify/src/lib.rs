pub mod dependency_tracker;
pub mod telemetry;
pub mod webhook;

pub use dependency_tracker::HttpDependencyTracker;
pub use telemetry::{init_tracing, TracingTelemetry};
pub use webhook::WebhookEventPublisher;
