pub mod adapters;
pub mod config;
pub mod error;
pub mod models;

pub use adapters::{
    AdvisoryQueue, ClaimMessage, DependencyTracker, EventPublisher, MessageAck,
    NoOpDependencyTracker, NoOpEventPublisher, NoOpTelemetry, PendingQueue, PolledMessage,
    TaskStore, Telemetry,
};
pub use config::ResolverConfig;
pub use error::{ResolverError, ResolverResult};
pub use models::{far_past, ReasonCreated, ReasonResolved, Routes, Run, RunId, RunState, Task};
