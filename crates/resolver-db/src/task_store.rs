use anyhow::Context;
use async_trait::async_trait;
use resolver_core::{ResolverError, ResolverResult, Task, TaskStore};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::row::TaskRow;

/// Postgres-backed `TaskStore`. `modify` retries its load-mutate-CAS loop up to
/// `max_cas_attempts` times before surfacing `ConcurrencyExhausted`.
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    max_cas_attempts: u32,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool, max_cas_attempts: u32) -> Self {
        Self {
            pool,
            max_cas_attempts,
        }
    }

    async fn fetch(&self, task_id: Uuid) -> ResolverResult<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch task")
            .map_err(ResolverError::Store)?;

        Ok(row.map(Task::from))
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn load(&self, task_id: Uuid) -> ResolverResult<Option<Task>> {
        self.fetch(task_id).await
    }

    async fn modify(
        &self,
        task_id: Uuid,
        mut modifier: Box<dyn FnMut(&Task) -> Task + Send>,
    ) -> ResolverResult<Task> {
        for _attempt in 0..self.max_cas_attempts {
            let current = self
                .fetch(task_id)
                .await?
                .ok_or(ResolverError::TaskNotFound(task_id))?;
            let next = modifier(&current);

            let result = sqlx::query(
                "UPDATE tasks SET \
                     task_group_id = $1, \
                     scheduler_id = $2, \
                     deadline = $3, \
                     retries_left = $4, \
                     taken_until = $5, \
                     runs = $6, \
                     routes = $7, \
                     version = version + 1 \
                 WHERE task_id = $8 AND version = $9",
            )
            .bind(next.task_group_id)
            .bind(&next.scheduler_id)
            .bind(next.deadline)
            .bind(next.retries_left)
            .bind(next.taken_until)
            .bind(Json(&next.runs))
            .bind(Json(&next.routes))
            .bind(task_id)
            .bind(current.version)
            .execute(&self.pool)
            .await
            .context("failed to apply task mutation")
            .map_err(ResolverError::Store)?;

            if result.rows_affected() == 1 {
                let mut written = next;
                written.version = current.version + 1;
                return Ok(written);
            }
            // Another resolver won the race on this task; reload and retry the modifier.
        }

        Err(ResolverError::ConcurrencyExhausted(
            task_id,
            self.max_cas_attempts,
        ))
    }
}
