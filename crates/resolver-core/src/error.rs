use thiserror::Error;
use uuid::Uuid;

use crate::models::RunId;

/// Errors raised while resolving an advisory-queue claim message.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("task {task_id} has no run {run_id}")]
    RunNotFound { task_id: Uuid, run_id: RunId },

    #[error("optimistic concurrency conflict on task {0}, giving up after {1} attempts")]
    ConcurrencyExhausted(Uuid, u32),

    #[error("advisory queue operation failed: {0}")]
    Queue(#[source] anyhow::Error),

    #[error("task store operation failed: {0}")]
    Store(#[source] anyhow::Error),

    #[error("event publish failed: {0}")]
    Publish(#[source] anyhow::Error),
}

pub type ResolverResult<T> = Result<T, ResolverError>;
