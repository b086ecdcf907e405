//! Poll Fan-out: within one iteration, runs `parallelism` concurrent poll
//! loops, each claiming a batch of advisory messages and dispatching them
//! concurrently to the Message Handler.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::handler::{handle_message, HandlerContext};

/// Per-batch telemetry record, matching the shape this codebase already logs
/// for queue polls (`messages_received`, `messages_failed`, plus a `resolver`
/// tag identifying which subsystem produced the batch).
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOutcome {
    pub messages_received: usize,
    pub messages_failed: usize,
}

/// Runs `parallelism` concurrent poll loops, each pulling one batch and
/// dispatching it. Returns the summed outcome across all loops in this
/// iteration so the Iteration Driver can judge liveness.
pub async fn run_iteration(
    ctx: &HandlerContext,
    parallelism: usize,
    batch_size: i64,
) -> anyhow::Result<BatchOutcome> {
    let loops: Vec<_> = (0..parallelism.max(1))
        .map(|_| poll_once(ctx.clone(), batch_size))
        .collect();

    let results = join_all(loops).await;

    let mut total = BatchOutcome::default();
    for result in results {
        let outcome = result?;
        total.messages_received += outcome.messages_received;
        total.messages_failed += outcome.messages_failed;
    }

    ctx.telemetry.log_info(&format!(
        "claim_poll messages_received={} messages_failed={} resolver=claim",
        total.messages_received, total.messages_failed
    ));

    Ok(total)
}

/// One poll loop: claim up to `batch_size` advisory messages and dispatch
/// every message to the handler concurrently. A single bad message never
/// aborts the batch; its error is counted and it is left un-acknowledged.
async fn poll_once(ctx: HandlerContext, batch_size: i64) -> anyhow::Result<BatchOutcome> {
    let polled = ctx.advisory_queue.poll(batch_size).await?;
    let received = polled.len();

    // Concurrency bound matches the batch size itself: up to 32 handler tasks
    // in flight per poll loop, never more than what was just claimed.
    let semaphore = Arc::new(Semaphore::new(received.max(1)));
    let dispatches = polled.into_iter().map(|polled_message| {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore is never closed during an iteration");
            handle_message(&ctx, polled_message.message, polled_message.ack).await
        }
    });

    let results = join_all(dispatches).await;
    let mut failed = 0;
    for result in results {
        if let Err(err) = result {
            ctx.telemetry.log_warn(&format!("claim handler failed: {err}"));
            failed += 1;
        }
    }

    Ok(BatchOutcome {
        messages_received: received,
        messages_failed: failed,
    })
}
