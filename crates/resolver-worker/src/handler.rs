//! The core claim-expiration algorithm: conditional load, guarded CAS mutation,
//! ownership-checked fan-out, acknowledgement.

use std::sync::Arc;

use chrono::Utc;
use resolver_core::{
    AdvisoryQueue, ClaimMessage, DependencyTracker, EventPublisher, MessageAck, PendingQueue,
    ReasonCreated, ReasonResolved, ResolverError, ResolverResult, Run, RunId, RunState, Task,
    TaskStore, Telemetry,
};

/// Everything a single message dispatch needs; cheap to clone, shared across
/// concurrently-dispatched handler tasks within one poll batch.
#[derive(Clone)]
pub struct HandlerContext {
    pub task_store: Arc<dyn TaskStore>,
    pub advisory_queue: Arc<dyn AdvisoryQueue>,
    pub pending_queue: Arc<dyn PendingQueue>,
    pub event_publisher: Arc<dyn EventPublisher>,
    pub dependency_tracker: Arc<dyn DependencyTracker>,
    pub telemetry: Arc<dyn Telemetry>,
}

/// Runs the full algorithm for one advisory message, including acknowledgement.
///
/// Returns `Ok(())` once the message has been handled to completion, whether
/// that completion was a real transition, a benign no-match, or a reported
/// data-integrity incident — all three still acknowledge. Returns `Err` only
/// for transient failures that must block acknowledgement so redelivery can
/// retry (error kind 3 in the error handling design).
pub async fn handle_message(ctx: &HandlerContext, message: ClaimMessage, ack: MessageAck) -> ResolverResult<()> {
    match resolve(ctx, &message).await {
        Ok(()) => {
            ctx.advisory_queue.ack(ack).await?;
            Ok(())
        }
        Err(err) if is_benign_or_reported(&err) => {
            if let ResolverError::RunNotFound { .. } = &err {
                ctx.telemetry.report_error(&anyhow::anyhow!(err.to_string()));
            }
            ctx.advisory_queue.ack(ack).await?;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn is_benign_or_reported(err: &ResolverError) -> bool {
    matches!(
        err,
        ResolverError::TaskNotFound(_) | ResolverError::RunNotFound { .. }
    )
}

/// Steps 1-3 of the algorithm. A `TaskNotFound`/`RunNotFound` result is the
/// "benign miss" / "data integrity" case from the error handling design: both
/// still acknowledge, only the latter gets reported.
async fn resolve(ctx: &HandlerContext, message: &ClaimMessage) -> ResolverResult<()> {
    // Step 1: conditional load. The predicate is `task.taken_until == message.taken_until`;
    // a loaded task whose taken_until has since moved on is the common "already
    // moved on" outcome, not an error, so it's folded into the same miss path.
    let loaded = ctx
        .task_store
        .load(message.task_id)
        .await?
        .ok_or(ResolverError::TaskNotFound(message.task_id))?;

    if loaded.taken_until != message.taken_until {
        return Err(ResolverError::TaskNotFound(message.task_id));
    }

    let run_id = message.run_id;

    // Invariant 3: the running run is always the last run. If the run this
    // message targets is still running and claim-matched but isn't the last
    // run, the record is already corrupt; report it and make no changes.
    if loaded
        .run(run_id)
        .map(|r| r.state == RunState::Running && r.taken_until == message.taken_until)
        .unwrap_or(false)
        && loaded.last_run_id() != Some(run_id)
    {
        ctx.telemetry.report_error(&anyhow::anyhow!(
            "task {} run {} is running but is not the last run; declining to resolve",
            message.task_id,
            run_id
        ));
        return Ok(());
    }

    // Step 2: guarded CAS mutation.
    let expected_taken_until = message.taken_until;
    let updated = ctx
        .task_store
        .modify(
            message.task_id,
            Box::new(move |snapshot: &Task| apply_expiration(snapshot, run_id, expected_taken_until)),
        )
        .await?;

    // Step 3: ownership-checked fan-out. Ownership is decided by comparing the
    // run's state immediately before this call's modify against immediately
    // after: only the call whose modifier actually drove `running` to
    // `exception/claim-expired` owns the transition. A redelivery that finds
    // the run already resolved sees no change across that boundary and
    // declines to fan out, which is what makes P1 hold across redeliveries
    // even though `task.taken_until` is deliberately never cleared.
    let was_running = loaded
        .run(run_id)
        .map(|r| r.state == RunState::Running)
        .unwrap_or(false);

    if !was_running {
        return Ok(());
    }

    fan_out(ctx, &updated, run_id).await
}

/// Pure function of a task snapshot implementing Step 2's modifier. `modify`
/// may invoke this more than once per call, so it must stay side-effect-free.
fn apply_expiration(task: &Task, run_id: RunId, expected_taken_until: chrono::DateTime<Utc>) -> Task {
    let mut next = task.clone();

    let run = match next.run(run_id).cloned() {
        Some(r) => r,
        None => return next, // the claim never actually created the run
    };

    if run.state != RunState::Running || run.taken_until != expected_taken_until {
        return next; // a concurrent reclaim or resolution won the race
    }

    if task.deadline <= Utc::now() {
        return next; // the deadline path is authoritative; avoid double-resolution
    }

    if task.last_run_id() != Some(run_id) {
        // Invariant 3 violated: the running run isn't the last run. `resolve`
        // already checks this against the loaded snapshot and reports it
        // before ever calling this modifier; this guard only covers the case
        // where the corruption appears between that check and a CAS retry's
        // fresh fetch. Either way: no mutation.
        return next;
    }

    let idx = run_id as usize;
    next.runs[idx].state = RunState::Exception;
    next.runs[idx].reason_resolved = Some(ReasonResolved::ClaimExpired);
    next.runs[idx].resolved = Some(Utc::now());
    // task.taken_until is deliberately left untouched: if fan-out fails below,
    // the advisory message stays a valid trigger on redelivery.

    if next.retries_left > 0 {
        next.retries_left -= 1;
        next.runs.push(Run::new_pending(ReasonCreated::Retry, Utc::now()));
    }

    next
}

/// Step 3: re-inspect the mutated snapshot and fan out only if this handler's
/// own transition produced the observed state.
async fn fan_out(ctx: &HandlerContext, task: &Task, run_id: RunId) -> ResolverResult<()> {
    let run = match task.run(run_id) {
        Some(r) => r,
        None => return Ok(()),
    };

    if run.state != RunState::Exception || run.reason_resolved != Some(ReasonResolved::ClaimExpired) {
        // No transition occurred (no-op modifier) or someone else already resolved it.
        return Ok(());
    }

    let last_run_id = task.last_run_id().unwrap_or(run_id);
    if last_run_id > run_id + 1 {
        // A third run appeared beyond our optional retry between mutation and
        // re-inspection. Treated as a benign concurrency outcome: ack silently.
        return Ok(());
    }

    let retry_run = task.run(run_id + 1).filter(|r| {
        task.last_run_id() == Some(run_id + 1)
            && r.state == RunState::Pending
            && r.reason_created == ReasonCreated::Retry
    });

    match retry_run {
        Some(_) => {
            ctx.pending_queue.put_pending_message(task.task_id, run_id + 1).await?;
            ctx.event_publisher.publish_retrying(task, run_id + 1).await?;
            ctx.telemetry
                .log_info(&format!("taskPending task_id={} run_id={}", task.task_id, run_id + 1));
        }
        None => {
            ctx.dependency_tracker
                .resolve_task(
                    task.task_id,
                    task.task_group_id,
                    &task.scheduler_id,
                    ReasonResolved::ClaimExpired,
                )
                .await?;
            ctx.event_publisher
                .publish_exception(task, run_id, ReasonResolved::ClaimExpired)
                .await?;
            ctx.telemetry
                .log_info(&format!("taskException task_id={} run_id={}", task.task_id, run_id));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use resolver_core::{far_past, NoOpDependencyTracker, NoOpTelemetry, Routes};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    struct FakeTaskStore {
        tasks: Mutex<HashMap<Uuid, Task>>,
    }

    impl FakeTaskStore {
        fn new(task: Task) -> Self {
            let mut tasks = HashMap::new();
            tasks.insert(task.task_id, task);
            Self {
                tasks: Mutex::new(tasks),
            }
        }
    }

    #[async_trait::async_trait]
    impl TaskStore for FakeTaskStore {
        async fn load(&self, task_id: Uuid) -> ResolverResult<Option<Task>> {
            Ok(self.tasks.lock().await.get(&task_id).cloned())
        }

        async fn modify(
            &self,
            task_id: Uuid,
            mut modifier: Box<dyn FnMut(&Task) -> Task + Send>,
        ) -> ResolverResult<Task> {
            let mut tasks = self.tasks.lock().await;
            let current = tasks.get(&task_id).cloned().ok_or(ResolverError::TaskNotFound(task_id))?;
            let mut next = modifier(&current);
            next.version = current.version + 1;
            tasks.insert(task_id, next.clone());
            Ok(next)
        }
    }

    #[derive(Default)]
    struct FakeAdvisoryQueue {
        acked: StdMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl AdvisoryQueue for FakeAdvisoryQueue {
        async fn poll(&self, _max_messages: i64) -> ResolverResult<Vec<resolver_core::PolledMessage>> {
            Ok(Vec::new())
        }

        async fn ack(&self, ack: MessageAck) -> ResolverResult<()> {
            self.acked.lock().unwrap().push(ack.receipt);
            Ok(())
        }

        async fn schedule(
            &self,
            _task_id: Uuid,
            _run_id: RunId,
            _visible_at: chrono::DateTime<Utc>,
        ) -> ResolverResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePendingQueue {
        enqueued: StdMutex<Vec<(Uuid, RunId)>>,
    }

    #[async_trait::async_trait]
    impl PendingQueue for FakePendingQueue {
        async fn put_pending_message(&self, task_id: Uuid, run_id: RunId) -> ResolverResult<()> {
            self.enqueued.lock().unwrap().push((task_id, run_id));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEventPublisher {
        exceptions: StdMutex<Vec<(Uuid, RunId)>>,
        retries: StdMutex<Vec<(Uuid, RunId)>>,
    }

    #[async_trait::async_trait]
    impl EventPublisher for FakeEventPublisher {
        async fn publish_exception(&self, task: &Task, run_id: RunId, _reason: ReasonResolved) -> ResolverResult<()> {
            self.exceptions.lock().unwrap().push((task.task_id, run_id));
            Ok(())
        }

        async fn publish_retrying(&self, task: &Task, run_id: RunId) -> ResolverResult<()> {
            self.retries.lock().unwrap().push((task.task_id, run_id));
            Ok(())
        }
    }

    fn running_task(retries_left: i32, deadline: chrono::DateTime<Utc>, taken_until: chrono::DateTime<Utc>) -> Task {
        Task {
            task_id: Uuid::new_v4(),
            task_group_id: Uuid::new_v4(),
            scheduler_id: "sched".into(),
            deadline,
            retries_left,
            taken_until,
            runs: vec![Run {
                state: RunState::Running,
                reason_created: ReasonCreated::Scheduled,
                reason_resolved: None,
                taken_until,
                worker_group: Some("wg".into()),
                worker_id: Some("w1".into()),
                scheduled: Utc::now() - Duration::minutes(5),
                resolved: None,
            }],
            routes: Routes::new(),
            version: 0,
        }
    }

    fn ctx_with(
        task: Task,
    ) -> (
        HandlerContext,
        Arc<FakeAdvisoryQueue>,
        Arc<FakePendingQueue>,
        Arc<FakeEventPublisher>,
    ) {
        let advisory_queue = Arc::new(FakeAdvisoryQueue::default());
        let pending_queue = Arc::new(FakePendingQueue::default());
        let event_publisher = Arc::new(FakeEventPublisher::default());
        let ctx = HandlerContext {
            task_store: Arc::new(FakeTaskStore::new(task)),
            advisory_queue: advisory_queue.clone(),
            pending_queue: pending_queue.clone(),
            event_publisher: event_publisher.clone(),
            dependency_tracker: Arc::new(NoOpDependencyTracker),
            telemetry: Arc::new(NoOpTelemetry),
        };
        (ctx, advisory_queue, pending_queue, event_publisher)
    }

    // S1: standard expiration, retries remain.
    #[tokio::test]
    async fn test_s1_expires_and_schedules_retry() {
        let t = Utc::now() - Duration::minutes(1);
        let deadline = Utc::now() + Duration::hours(1);
        let task = running_task(2, deadline, t);
        let task_id = task.task_id;
        let (ctx, advisory, pending, publisher) = ctx_with(task);

        let message = ClaimMessage {
            task_id,
            run_id: 0,
            taken_until: t,
            receipt: "r1".into(),
        };
        handle_message(&ctx, message, MessageAck { receipt: "r1".into() })
            .await
            .unwrap();

        let updated = ctx.task_store.load(task_id).await.unwrap().unwrap();
        assert_eq!(updated.runs[0].state, RunState::Exception);
        assert_eq!(updated.runs[0].reason_resolved, Some(ReasonResolved::ClaimExpired));
        assert_eq!(updated.runs[1].state, RunState::Pending);
        assert_eq!(updated.retries_left, 1);
        assert_eq!(pending.enqueued.lock().unwrap().as_slice(), &[(task_id, 1)]);
        assert_eq!(publisher.retries.lock().unwrap().as_slice(), &[(task_id, 1)]);
        assert!(publisher.exceptions.lock().unwrap().is_empty());
        assert_eq!(advisory.acked.lock().unwrap().as_slice(), &["r1".to_string()]);
    }

    // S2: standard expiration, no retries left.
    #[tokio::test]
    async fn test_s2_expires_terminally_without_retries() {
        let t = Utc::now() - Duration::minutes(1);
        let deadline = Utc::now() + Duration::hours(1);
        let task = running_task(0, deadline, t);
        let task_id = task.task_id;
        let (ctx, advisory, pending, publisher) = ctx_with(task);

        let message = ClaimMessage {
            task_id,
            run_id: 0,
            taken_until: t,
            receipt: "r2".into(),
        };
        handle_message(&ctx, message, MessageAck { receipt: "r2".into() })
            .await
            .unwrap();

        let updated = ctx.task_store.load(task_id).await.unwrap().unwrap();
        assert_eq!(updated.runs.len(), 1);
        assert_eq!(updated.runs[0].state, RunState::Exception);
        assert!(pending.enqueued.lock().unwrap().is_empty());
        assert_eq!(publisher.exceptions.lock().unwrap().as_slice(), &[(task_id, 0)]);
        assert_eq!(advisory.acked.lock().unwrap().as_slice(), &["r2".to_string()]);
    }

    // S3: stale message after reclaim bumped taken_until.
    #[tokio::test]
    async fn test_s3_stale_message_after_reclaim_is_noop() {
        let original = Utc::now() - Duration::minutes(5);
        let bumped = Utc::now() + Duration::minutes(5);
        let deadline = Utc::now() + Duration::hours(1);
        let task = running_task(2, deadline, bumped);
        let task_id = task.task_id;
        let (ctx, advisory, pending, publisher) = ctx_with(task);

        let message = ClaimMessage {
            task_id,
            run_id: 0,
            taken_until: original,
            receipt: "r3".into(),
        };
        handle_message(&ctx, message, MessageAck { receipt: "r3".into() })
            .await
            .unwrap();

        let updated = ctx.task_store.load(task_id).await.unwrap().unwrap();
        assert_eq!(updated.runs[0].state, RunState::Running);
        assert!(pending.enqueued.lock().unwrap().is_empty());
        assert!(publisher.exceptions.lock().unwrap().is_empty());
        assert!(publisher.retries.lock().unwrap().is_empty());
        assert_eq!(advisory.acked.lock().unwrap().as_slice(), &["r3".to_string()]);
    }

    // S4: deadline already passed, modifier must no-op even though the run matches.
    #[tokio::test]
    async fn test_s4_deadline_exceeded_suppresses_expiration() {
        let t = Utc::now() - Duration::minutes(1);
        let deadline = Utc::now() - Duration::seconds(1);
        let task = running_task(2, deadline, t);
        let task_id = task.task_id;
        let (ctx, advisory, _pending, publisher) = ctx_with(task);

        let message = ClaimMessage {
            task_id,
            run_id: 0,
            taken_until: t,
            receipt: "r4".into(),
        };
        handle_message(&ctx, message, MessageAck { receipt: "r4".into() })
            .await
            .unwrap();

        let updated = ctx.task_store.load(task_id).await.unwrap().unwrap();
        assert_eq!(updated.runs[0].state, RunState::Running);
        assert!(publisher.exceptions.lock().unwrap().is_empty());
        assert_eq!(advisory.acked.lock().unwrap().as_slice(), &["r4".to_string()]);
    }

    // Invariant 3: the claim-matched running run isn't the last run. The
    // record is already corrupt; no mutation, no notification, reported.
    #[tokio::test]
    async fn test_non_last_running_run_is_reported_without_mutation_or_notification() {
        let t = Utc::now() - Duration::minutes(1);
        let deadline = Utc::now() + Duration::hours(1);
        let mut task = running_task(2, deadline, t);
        task.runs.push(Run::new_pending(ReasonCreated::Retry, Utc::now()));
        let task_id = task.task_id;
        let (ctx, advisory, pending, publisher) = ctx_with(task);

        let message = ClaimMessage {
            task_id,
            run_id: 0,
            taken_until: t,
            receipt: "r5".into(),
        };
        handle_message(&ctx, message, MessageAck { receipt: "r5".into() })
            .await
            .unwrap();

        let updated = ctx.task_store.load(task_id).await.unwrap().unwrap();
        assert_eq!(updated.runs[0].state, RunState::Running);
        assert_eq!(updated.runs.len(), 2);
        assert!(pending.enqueued.lock().unwrap().is_empty());
        assert!(publisher.exceptions.lock().unwrap().is_empty());
        assert!(publisher.retries.lock().unwrap().is_empty());
        assert_eq!(advisory.acked.lock().unwrap().as_slice(), &["r5".to_string()]);
    }

    // P1/P5: redelivery of an already-resolved message acks without re-publishing.
    #[tokio::test]
    async fn test_redelivery_after_resolution_is_idempotent() {
        let t = Utc::now() - Duration::minutes(1);
        let deadline = Utc::now() + Duration::hours(1);
        let task = running_task(0, deadline, t);
        let task_id = task.task_id;
        let (ctx, _advisory, _pending, publisher) = ctx_with(task);

        let message = ClaimMessage {
            task_id,
            run_id: 0,
            taken_until: t,
            receipt: "first".into(),
        };
        handle_message(&ctx, message.clone(), MessageAck { receipt: "first".into() })
            .await
            .unwrap();
        assert_eq!(publisher.exceptions.lock().unwrap().len(), 1);

        // Redelivered message: taken_until on the stored task is now far_past
        // only if cleared, but invariant says it's left untouched at `t`, so a
        // second delivery with the same `t` would re-match the conditional
        // load. The CAS modifier must still no-op because run.state is no
        // longer "running".
        handle_message(&ctx, message, MessageAck { receipt: "first-redelivered".into() })
            .await
            .unwrap();
        assert_eq!(publisher.exceptions.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_far_past_is_not_a_valid_claim_sentinel_collision() {
        assert_ne!(far_past(), Utc::now());
    }
}
