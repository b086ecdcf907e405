use chrono::{DateTime, Utc};
use resolver_core::{Routes, Run, Task};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Wire shape of a `tasks` row; `runs` and `routes` round-trip through `jsonb`
/// without a join, per the persistence layout this store follows.
#[derive(Debug, FromRow)]
pub struct TaskRow {
    pub task_id: Uuid,
    pub task_group_id: Uuid,
    pub scheduler_id: String,
    pub deadline: DateTime<Utc>,
    pub retries_left: i32,
    pub taken_until: DateTime<Utc>,
    pub runs: Json<Vec<Run>>,
    pub routes: Json<Routes>,
    pub version: i64,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            task_id: row.task_id,
            task_group_id: row.task_group_id,
            scheduler_id: row.scheduler_id,
            deadline: row.deadline,
            retries_left: row.retries_left,
            taken_until: row.taken_until,
            runs: row.runs.0,
            routes: row.routes.0,
            version: row.version,
        }
    }
}
