use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use resolver_core::{
    AdvisoryQueue, ClaimMessage, MessageAck, PolledMessage, ResolverError, ResolverResult, RunId,
};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// Postgres-backed advisory queue: visibility-delayed, at-least-once, claimed
/// with `FOR UPDATE SKIP LOCKED` so concurrent pollers never double-claim a row.
#[derive(Clone)]
pub struct PostgresAdvisoryQueue {
    pool: PgPool,
    visibility_timeout: Duration,
}

impl PostgresAdvisoryQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl AdvisoryQueue for PostgresAdvisoryQueue {
    async fn poll(&self, max_messages: i64) -> ResolverResult<Vec<PolledMessage>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to start poll transaction")
            .map_err(ResolverError::Queue)?;

        let claimed: Vec<(i64, Uuid, RunId, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, task_id, run_id, visible_at FROM claim_advisory_queue \
             WHERE visible_at <= now() AND (invisible_until IS NULL OR invisible_until <= now()) \
             ORDER BY visible_at \
             FOR UPDATE SKIP LOCKED \
             LIMIT $1",
        )
        .bind(max_messages)
        .fetch_all(&mut *tx)
        .await
        .context("failed to claim advisory messages")
        .map_err(ResolverError::Queue)?;

        if claimed.is_empty() {
            tx.commit()
                .await
                .context("failed to commit empty poll")
                .map_err(ResolverError::Queue)?;
            return Ok(Vec::new());
        }

        let timeout = ChronoDuration::from_std(self.visibility_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        let invisible_until = Utc::now() + timeout;
        let ids: Vec<i64> = claimed.iter().map(|(id, ..)| *id).collect();

        sqlx::query("UPDATE claim_advisory_queue SET invisible_until = $1 WHERE id = ANY($2)")
            .bind(invisible_until)
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .context("failed to mark advisory messages invisible")
            .map_err(ResolverError::Queue)?;

        tx.commit()
            .await
            .context("failed to commit poll transaction")
            .map_err(ResolverError::Queue)?;

        Ok(claimed
            .into_iter()
            .map(|(id, task_id, run_id, taken_until)| PolledMessage {
                message: ClaimMessage {
                    task_id,
                    run_id,
                    taken_until,
                    receipt: id.to_string(),
                },
                ack: MessageAck {
                    receipt: id.to_string(),
                },
            })
            .collect())
    }

    async fn ack(&self, ack: MessageAck) -> ResolverResult<()> {
        let id: i64 = ack
            .receipt
            .parse()
            .context("malformed advisory queue receipt")
            .map_err(ResolverError::Queue)?;

        // A second ack for the same receipt deletes zero rows; acknowledgement
        // is idempotent by construction.
        sqlx::query("DELETE FROM claim_advisory_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to acknowledge advisory message")
            .map_err(ResolverError::Queue)?;

        Ok(())
    }

    async fn schedule(
        &self,
        task_id: Uuid,
        run_id: RunId,
        visible_at: DateTime<Utc>,
    ) -> ResolverResult<()> {
        sqlx::query(
            "INSERT INTO claim_advisory_queue (task_id, run_id, visible_at) VALUES ($1, $2, $3)",
        )
        .bind(task_id)
        .bind(run_id)
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .context("failed to schedule advisory message")
        .map_err(ResolverError::Queue)?;

        Ok(())
    }
}
