use anyhow::Context;
use async_trait::async_trait;
use resolver_core::{PendingQueue, ResolverError, ResolverResult, RunId};
use sqlx::PgPool;
use uuid::Uuid;

/// Best-effort, non-delayed dispatch queue consumed by workers picking up retries.
#[derive(Clone)]
pub struct PostgresPendingQueue {
    pool: PgPool,
}

impl PostgresPendingQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PendingQueue for PostgresPendingQueue {
    async fn put_pending_message(&self, task_id: Uuid, run_id: RunId) -> ResolverResult<()> {
        sqlx::query("INSERT INTO pending_message_queue (task_id, run_id) VALUES ($1, $2)")
            .bind(task_id)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .context("failed to enqueue pending message")
            .map_err(ResolverError::Queue)?;

        Ok(())
    }
}
