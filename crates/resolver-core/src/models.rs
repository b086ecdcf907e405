//! Domain model for the claim expiration resolver: tasks, runs, and the
//! advisory message that wakes the resolver when a claim expires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// A run's position within `Task.runs`.
pub type RunId = i32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "text"))]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Failed => write!(f, "failed"),
            RunState::Exception => write!(f, "exception"),
        }
    }
}

impl FromStr for RunState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "completed" => Ok(RunState::Completed),
            "failed" => Ok(RunState::Failed),
            "exception" => Ok(RunState::Exception),
            _ => Err(anyhow::anyhow!("invalid run state: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCreated {
    Scheduled,
    Retry,
    TaskRetry,
}

impl Display for ReasonCreated {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ReasonCreated::Scheduled => write!(f, "scheduled"),
            ReasonCreated::Retry => write!(f, "retry"),
            ReasonCreated::TaskRetry => write!(f, "task-retry"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonResolved {
    Completed,
    Failed,
    DeadlineExceeded,
    ClaimExpired,
    Canceled,
}

impl Display for ReasonResolved {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ReasonResolved::Completed => write!(f, "completed"),
            ReasonResolved::Failed => write!(f, "failed"),
            ReasonResolved::DeadlineExceeded => write!(f, "deadline-exceeded"),
            ReasonResolved::ClaimExpired => write!(f, "claim-expired"),
            ReasonResolved::Canceled => write!(f, "canceled"),
        }
    }
}

/// One attempt to execute a task. Embedded within `Task.runs`; its index is its `RunId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub state: RunState,
    pub reason_created: ReasonCreated,
    pub reason_resolved: Option<ReasonResolved>,
    pub taken_until: DateTime<Utc>,
    pub worker_group: Option<String>,
    pub worker_id: Option<String>,
    pub scheduled: DateTime<Utc>,
    pub resolved: Option<DateTime<Utc>>,
}

impl Run {
    /// A fresh run created for an initial scheduling or a retry.
    pub fn new_pending(reason_created: ReasonCreated, scheduled: DateTime<Utc>) -> Self {
        Self {
            state: RunState::Pending,
            reason_created,
            reason_resolved: None,
            taken_until: far_past(),
            worker_group: None,
            worker_id: None,
            scheduled,
            resolved: None,
        }
    }
}

/// Sentinel "no claim outstanding" timestamp: invariant 1 requires this to compare
/// less than any real `takenUntil`, and it must never collide with a legitimate claim.
pub fn far_past() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is a valid timestamp")
}

/// Notification routing metadata, opaque to the resolver beyond pass-through.
pub type Routes = Vec<String>;

/// Persistent record keyed by `task_id`; see invariants 1-4 in the specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub task_group_id: Uuid,
    pub scheduler_id: String,
    pub deadline: DateTime<Utc>,
    pub retries_left: i32,
    /// Mirrors the `takenUntil` of the unique running run, or `far_past()` if none is running.
    pub taken_until: DateTime<Utc>,
    pub runs: Vec<Run>,
    pub routes: Routes,
    /// Optimistic-concurrency token, incremented on every successful `modify`.
    pub version: i64,
}

impl Task {
    pub fn run(&self, run_id: RunId) -> Option<&Run> {
        usize::try_from(run_id)
            .ok()
            .and_then(|idx| self.runs.get(idx))
    }

    pub fn last_run_id(&self) -> Option<RunId> {
        if self.runs.is_empty() {
            None
        } else {
            Some((self.runs.len() - 1) as RunId)
        }
    }
}
