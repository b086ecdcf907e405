//! Seams between the resolver's pure algorithm and the outside world. Every
//! collaborator is constructor-injected; the resolver holds no global state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ResolverResult;
use crate::models::{RunId, Task};

/// A claim-expiration notice popped off the advisory (delay) queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimMessage {
    pub task_id: Uuid,
    pub run_id: RunId,
    /// The claim deadline this message was scheduled against. Step 1's
    /// conditional load matches a task only when its current `taken_until`
    /// still equals this value.
    pub taken_until: DateTime<Utc>,
    /// Opaque handle the queue needs back to acknowledge or release this message.
    pub receipt: String,
}

/// Returned by a poll; each message is paired with the means to acknowledge it.
pub struct PolledMessage {
    pub message: ClaimMessage,
    pub ack: MessageAck,
}

/// Idempotent acknowledgement handle for one polled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAck {
    pub receipt: String,
}

/// The time-delayed, at-least-once, visibility-timeout queue backing claim expiry.
///
/// Messages become visible no earlier than their scheduled delay and, once
/// claimed by a poll, stay invisible to other pollers until acknowledged or
/// until the visibility timeout lapses.
#[async_trait]
pub trait AdvisoryQueue: Send + Sync {
    async fn poll(&self, max_messages: i64) -> ResolverResult<Vec<PolledMessage>>;
    async fn ack(&self, ack: MessageAck) -> ResolverResult<()>;
    async fn schedule(
        &self,
        task_id: Uuid,
        run_id: RunId,
        visible_at: DateTime<Utc>,
    ) -> ResolverResult<()>;
}

/// The best-effort, non-delayed queue that carries retry-dispatch messages to workers.
#[async_trait]
pub trait PendingQueue: Send + Sync {
    async fn put_pending_message(&self, task_id: Uuid, run_id: RunId) -> ResolverResult<()>;
}

/// Optimistic-concurrency task storage: a single `task_id`-keyed record per task,
/// mutated only through `modify`'s load-then-compare-and-swap loop.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load(&self, task_id: Uuid) -> ResolverResult<Option<Task>>;

    /// Applies `modifier` to a freshly loaded snapshot and writes it back only if
    /// the stored version hasn't changed since the load. Retries on conflict up
    /// to an adapter-defined bound, surfacing `ResolverError::ConcurrencyExhausted`
    /// past that bound. `modifier` must be a pure function of the snapshot: it may
    /// run more than once per call.
    async fn modify(
        &self,
        task_id: Uuid,
        modifier: Box<dyn FnMut(&Task) -> Task + Send>,
    ) -> ResolverResult<Task>;
}

/// Propagates a task's terminal resolution to the scheduler's dependency
/// graph so dependent tasks can be unblocked or re-evaluated.
#[async_trait]
pub trait DependencyTracker: Send + Sync {
    async fn resolve_task(
        &self,
        task_id: Uuid,
        task_group_id: Uuid,
        scheduler_id: &str,
        resolution: crate::models::ReasonResolved,
    ) -> ResolverResult<()>;
}

/// Outbound event delivery: task-exception / task-retrying notifications to routes.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_exception(
        &self,
        task: &Task,
        run_id: RunId,
        reason: crate::models::ReasonResolved,
    ) -> ResolverResult<()>;

    async fn publish_retrying(&self, task: &Task, run_id: RunId) -> ResolverResult<()>;
}

/// Structured logging, error reporting, and alerting seam.
#[async_trait]
pub trait Telemetry: Send + Sync {
    fn log_info(&self, message: &str);
    fn log_warn(&self, message: &str);
    fn report_error(&self, error: &anyhow::Error);
    /// A condition severe enough that the iteration driver should stop the process.
    async fn alert_fatal(&self, message: &str);
}

/// A `Telemetry` that drops everything but fatal alerts, used in tests and as a
/// placeholder before a real adapter is wired up.
pub struct NoOpTelemetry;

#[async_trait]
impl Telemetry for NoOpTelemetry {
    fn log_info(&self, _message: &str) {}
    fn log_warn(&self, _message: &str) {}
    fn report_error(&self, _error: &anyhow::Error) {}
    async fn alert_fatal(&self, _message: &str) {}
}

/// A `DependencyTracker` that drops every resolution, matching a deployment
/// that doesn't use task-graph scheduling.
pub struct NoOpDependencyTracker;

#[async_trait]
impl DependencyTracker for NoOpDependencyTracker {
    async fn resolve_task(
        &self,
        _task_id: Uuid,
        _task_group_id: Uuid,
        _scheduler_id: &str,
        _resolution: crate::models::ReasonResolved,
    ) -> ResolverResult<()> {
        Ok(())
    }
}

/// An `EventPublisher` that only logs, for deployments with no webhook endpoint
/// configured yet.
pub struct NoOpEventPublisher;

#[async_trait]
impl EventPublisher for NoOpEventPublisher {
    async fn publish_exception(
        &self,
        _task: &Task,
        _run_id: RunId,
        _reason: crate::models::ReasonResolved,
    ) -> ResolverResult<()> {
        Ok(())
    }

    async fn publish_retrying(&self, _task: &Task, _run_id: RunId) -> ResolverResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_dependency_tracker_resolves_ok() {
        let tracker = NoOpDependencyTracker;
        tracker
            .resolve_task(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "sched",
                crate::models::ReasonResolved::ClaimExpired,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_noop_telemetry_does_not_panic() {
        let telemetry = NoOpTelemetry;
        telemetry.log_info("hello");
        telemetry.log_warn("careful");
        telemetry.report_error(&anyhow::anyhow!("boom"));
        telemetry.alert_fatal("stop").await;
    }
}
