//! Database query functions for the `tasks` and `runs` tables.
//!
//! Mutations that touch both tables (appending a run, resolving a run,
//! transitioning a run to `running`) run inside a transaction with a
//! `SELECT ... FOR UPDATE` on the task row, so concurrent calls against the
//! same task serialize at the database rather than retrying a
//! compare-and-swap loop in application code. The `version` column is still
//! bumped on every write and returned to callers, since `EntityAlreadyExists`
//! handling needs to compare full definitions, not just an opaque etag.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{RunRow, TaskRow, TaskWithRuns};

/// Fields needed to insert a new `tasks` row. Distinct from [`TaskRow`]
/// because `retries_left`/`taken_until`/`unresolved_deps`/`version` are
/// server-assigned at creation time.
#[derive(Debug, Clone)]
pub struct NewTaskRow {
    pub task_id: String,
    pub provisioner_id: String,
    pub worker_type: String,
    pub scheduler_id: String,
    pub task_group_id: String,
    pub requires: String,
    pub priority: String,
    pub retries: i32,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub scopes: Json,
    pub routes: Json,
    pub tags: Json,
    pub payload: Json,
    pub metadata_extra: Json,
    pub unresolved_deps: i32,
}

/// Fields needed to insert a new `runs` row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: i32,
    pub state: String,
    pub reason_created: String,
    pub scheduled: Option<DateTime<Utc>>,
}

impl NewRun {
    pub fn pending(run_id: i32, reason_created: &str, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            state: "pending".to_owned(),
            reason_created: reason_created.to_owned(),
            scheduled: Some(now),
        }
    }
}

/// `createTask` can collide on `task_id`; callers need to distinguish that
/// from every other failure so they can reload and compare definitions.
#[derive(Debug, thiserror::Error)]
pub enum CreateTaskError {
    #[error("task already exists")]
    AlreadyExists,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Insert a new task row, plus its initial run if one is given (tasks with
/// zero dependencies start with a `pending` run 0; tasks with dependencies
/// start with no runs).
pub async fn create_task(
    pool: &PgPool,
    row: &NewTaskRow,
    first_run: Option<&NewRun>,
) -> std::result::Result<TaskWithRuns, CreateTaskError> {
    let mut tx = pool.begin().await.context("begin create_task txn")?;

    let insert = sqlx::query(
        "INSERT INTO tasks \
         (task_id, provisioner_id, worker_type, scheduler_id, task_group_id, requires, \
          priority, retries, retries_left, created, deadline, expires, taken_until, \
          scopes, routes, tags, payload, metadata_extra, unresolved_deps, version) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9, $10, $11, 'epoch', \
                 $12, $13, $14, $15, $16, $17, 0)",
    )
    .bind(&row.task_id)
    .bind(&row.provisioner_id)
    .bind(&row.worker_type)
    .bind(&row.scheduler_id)
    .bind(&row.task_group_id)
    .bind(&row.requires)
    .bind(&row.priority)
    .bind(row.retries)
    .bind(row.created)
    .bind(row.deadline)
    .bind(row.expires)
    .bind(&row.scopes)
    .bind(&row.routes)
    .bind(&row.tags)
    .bind(&row.payload)
    .bind(&row.metadata_extra)
    .bind(row.unresolved_deps)
    .execute(&mut *tx)
    .await;

    if let Err(sqlx::Error::Database(ref db_err)) = insert {
        if db_err.is_unique_violation() {
            return Err(CreateTaskError::AlreadyExists);
        }
    }
    insert.context("failed to insert task row")?;

    if let Some(run) = first_run {
        insert_run(&mut tx, &row.task_id, run)
            .await
            .context("failed to insert initial run")?;
    }

    tx.commit().await.context("commit create_task txn")?;

    load_task(pool, &row.task_id)
        .await
        .context("reload after create_task")?
        .context("task vanished immediately after creation")
        .map_err(CreateTaskError::Other)
}

async fn insert_run(
    tx: &mut Transaction<'_, Postgres>,
    task_id: &str,
    run: &NewRun,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO runs (task_id, run_id, state, reason_created, scheduled) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(task_id)
    .bind(run.run_id)
    .bind(&run.state)
    .bind(&run.reason_created)
    .bind(run.scheduled)
    .execute(&mut **tx)
    .await
    .context("failed to insert run row")?;
    Ok(())
}

/// Load a task and its full run sequence.
pub async fn load_task(pool: &PgPool, task_id: &str) -> Result<Option<TaskWithRuns>> {
    let task = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to load task")?;

    let Some(task) = task else {
        return Ok(None);
    };

    let runs = sqlx::query_as::<_, RunRow>(
        "SELECT * FROM runs WHERE task_id = $1 ORDER BY run_id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to load runs")?;

    Ok(Some(TaskWithRuns { task, runs }))
}

async fn load_task_locked(
    tx: &mut Transaction<'_, Postgres>,
    task_id: &str,
) -> Result<Option<TaskWithRuns>> {
    let task = sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE task_id = $1 FOR UPDATE")
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to load task for update")?;

    let Some(task) = task else {
        return Ok(None);
    };

    let runs = sqlx::query_as::<_, RunRow>(
        "SELECT * FROM runs WHERE task_id = $1 ORDER BY run_id ASC",
    )
    .bind(task_id)
    .fetch_all(&mut **tx)
    .await
    .context("failed to load runs for update")?;

    Ok(Some(TaskWithRuns { task, runs }))
}

/// Append a new run (retry, rerun, or the dependency-unblocked initial run)
/// and optionally update `retries_left` in the same transaction. Bumps
/// `version`. Returns `None` if the task does not exist.
pub async fn append_run(
    pool: &PgPool,
    task_id: &str,
    run: &NewRun,
    new_retries_left: Option<i32>,
) -> Result<Option<TaskWithRuns>> {
    let mut tx = pool.begin().await.context("begin append_run txn")?;

    if load_task_locked(&mut tx, task_id).await?.is_none() {
        return Ok(None);
    }

    insert_run(&mut tx, task_id, run).await?;

    if let Some(retries_left) = new_retries_left {
        sqlx::query("UPDATE tasks SET retries_left = $1, version = version + 1 WHERE task_id = $2")
            .bind(retries_left)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .context("failed to update retries_left")?;
    } else {
        sqlx::query("UPDATE tasks SET version = version + 1 WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .context("failed to bump task version")?;
    }

    tx.commit().await.context("commit append_run txn")?;

    load_task(pool, task_id).await
}

/// Transition a `pending` run to `running`, claiming it for a worker, and
/// set `task.taken_until` to the same value.
pub async fn start_run(
    pool: &PgPool,
    task_id: &str,
    run_id: i32,
    worker_group: &str,
    worker_id: &str,
    started: DateTime<Utc>,
    taken_until: DateTime<Utc>,
) -> Result<Option<TaskWithRuns>> {
    let mut tx = pool.begin().await.context("begin start_run txn")?;

    if load_task_locked(&mut tx, task_id).await?.is_none() {
        return Ok(None);
    }

    sqlx::query(
        "UPDATE runs SET state = 'running', started = $1, worker_group = $2, worker_id = $3, \
         run_taken_until = $4 \
         WHERE task_id = $5 AND run_id = $6",
    )
    .bind(started)
    .bind(worker_group)
    .bind(worker_id)
    .bind(taken_until)
    .bind(task_id)
    .bind(run_id)
    .execute(&mut *tx)
    .await
    .context("failed to start run")?;

    sqlx::query("UPDATE tasks SET taken_until = $1, version = version + 1 WHERE task_id = $2")
        .bind(taken_until)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to update task taken_until")?;

    tx.commit().await.context("commit start_run txn")?;

    load_task(pool, task_id).await
}

/// Refresh a running run's `takenUntil` (used by `reclaim`).
pub async fn refresh_taken_until(
    pool: &PgPool,
    task_id: &str,
    run_id: i32,
    taken_until: DateTime<Utc>,
) -> Result<Option<TaskWithRuns>> {
    let mut tx = pool.begin().await.context("begin refresh_taken_until txn")?;

    if load_task_locked(&mut tx, task_id).await?.is_none() {
        return Ok(None);
    }

    sqlx::query("UPDATE runs SET run_taken_until = $1 WHERE task_id = $2 AND run_id = $3")
        .bind(taken_until)
        .bind(task_id)
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .context("failed to refresh run taken_until")?;

    sqlx::query("UPDATE tasks SET taken_until = $1, version = version + 1 WHERE task_id = $2")
        .bind(taken_until)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to refresh task taken_until")?;

    tx.commit().await.context("commit refresh_taken_until txn")?;

    load_task(pool, task_id).await
}

/// Resolve a run into a terminal state (`completed`, `failed`, or
/// `exception`). Bumps `version`.
pub async fn resolve_run(
    pool: &PgPool,
    task_id: &str,
    run_id: i32,
    state: &str,
    reason_resolved: &str,
    resolved: DateTime<Utc>,
) -> Result<Option<TaskWithRuns>> {
    let mut tx = pool.begin().await.context("begin resolve_run txn")?;

    if load_task_locked(&mut tx, task_id).await?.is_none() {
        return Ok(None);
    }

    sqlx::query(
        "UPDATE runs SET state = $1, reason_resolved = $2, resolved = $3 \
         WHERE task_id = $4 AND run_id = $5",
    )
    .bind(state)
    .bind(reason_resolved)
    .bind(resolved)
    .bind(task_id)
    .bind(run_id)
    .execute(&mut *tx)
    .await
    .context("failed to resolve run")?;

    sqlx::query("UPDATE tasks SET version = version + 1 WHERE task_id = $1")
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to bump task version")?;

    tx.commit().await.context("commit resolve_run txn")?;

    load_task(pool, task_id).await
}

/// Set the per-dependent unresolved-dependency counter (on task creation).
pub async fn set_unresolved_deps(pool: &PgPool, task_id: &str, count: i32) -> Result<()> {
    sqlx::query("UPDATE tasks SET unresolved_deps = $1, version = version + 1 WHERE task_id = $2")
        .bind(count)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set unresolved_deps")?;
    Ok(())
}

/// Atomically decrement the unresolved-dependency counter and return the
/// post-decrement value, locking the row so concurrent resolutions of
/// sibling dependencies serialize correctly. Returns `None` if the task is
/// missing.
pub async fn decrement_unresolved_deps(pool: &PgPool, task_id: &str) -> Result<Option<i32>> {
    let mut tx = pool.begin().await.context("begin decrement_unresolved_deps txn")?;

    let current: Option<i32> =
        sqlx::query_scalar("SELECT unresolved_deps FROM tasks WHERE task_id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to lock task for dependency decrement")?;

    let Some(current) = current else {
        return Ok(None);
    };

    let next = (current - 1).max(0);

    sqlx::query("UPDATE tasks SET unresolved_deps = $1, version = version + 1 WHERE task_id = $2")
        .bind(next)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to decrement unresolved_deps")?;

    tx.commit().await.context("commit decrement_unresolved_deps txn")?;

    Ok(Some(next))
}

/// List every task sharing a task group, for `listTaskGroup`.
pub async fn list_by_group(pool: &PgPool, task_group_id: &str) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks WHERE task_group_id = $1 ORDER BY created ASC",
    )
    .bind(task_group_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks by group")?;
    Ok(tasks)
}

/// List the tasks that directly depend on `required_task_id`, for
/// `listDependentTasks`.
pub async fn list_dependents(pool: &PgPool, required_task_id: &str) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT t.* FROM tasks t \
         JOIN task_dependencies td ON td.dependent_task_id = t.task_id \
         WHERE td.required_task_id = $1 \
         ORDER BY t.created ASC",
    )
    .bind(required_task_id)
    .fetch_all(pool)
    .await
    .context("failed to list dependent tasks")?;
    Ok(tasks)
}

/// Paginated scan over every task whose last run is `pending`, for
/// `pendingTasks`. `after` is the last-seen `task_id` from a
/// prior page (simple keyset pagination).
pub async fn scan_pending(
    pool: &PgPool,
    provisioner_id: &str,
    worker_type: &str,
    after: Option<&str>,
    limit: i64,
) -> Result<Vec<TaskRow>> {
    let tasks = sqlx::query_as::<_, TaskRow>(
        "SELECT t.* FROM tasks t \
         WHERE t.provisioner_id = $1 AND t.worker_type = $2 \
           AND ($3::text IS NULL OR t.task_id > $3) \
           AND EXISTS ( \
               SELECT 1 FROM runs r \
               WHERE r.task_id = t.task_id \
               ORDER BY r.run_id DESC LIMIT 1 \
           ) \
           AND (SELECT r.state FROM runs r WHERE r.task_id = t.task_id ORDER BY r.run_id DESC LIMIT 1) = 'pending' \
         ORDER BY t.task_id ASC \
         LIMIT $4",
    )
    .bind(provisioner_id)
    .bind(worker_type)
    .bind(after)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to scan pending tasks")?;
    Ok(tasks)
}

/// One `running` run with no matching `claim-expiration` message on the
/// advisory queue — the crash window between the Store commit and the
/// queue `put`. Returned by
/// [`list_orphaned_running_runs`] for a resolver-startup recovery sweep.
pub struct OrphanedRun {
    pub task_id: String,
    pub run_id: i32,
    pub taken_until: DateTime<Utc>,
}

/// Find every `running` run whose claim-expiration message is missing,
/// so every running run is guaranteed a path back to resolution once at
/// resolver startup rather than relying solely on the message having
/// survived a crash.
pub async fn list_orphaned_running_runs(pool: &PgPool) -> Result<Vec<OrphanedRun>> {
    let rows: Vec<(String, i32, Option<DateTime<Utc>>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT r.task_id, r.run_id, r.run_taken_until, t.taken_until \
         FROM runs r \
         JOIN tasks t ON t.task_id = r.task_id \
         WHERE r.state = 'running' \
           AND NOT EXISTS ( \
               SELECT 1 FROM advisory_queue_messages q \
               WHERE q.queue = 'claim-expiration' \
                 AND q.payload ->> 'taskId' = r.task_id \
                 AND (q.payload ->> 'runId')::int = r.run_id \
           )",
    )
    .fetch_all(pool)
    .await
    .context("failed to scan orphaned running runs")?;

    Ok(rows
        .into_iter()
        .map(|(task_id, run_id, run_taken_until, task_taken_until)| OrphanedRun {
            task_id,
            run_id,
            taken_until: run_taken_until.unwrap_or(task_taken_until),
        })
        .collect())
}

/// Deadline-resolver recovery scan: every task whose deadline has passed,
/// whose last run is non-terminal (or which has no runs at all), and which
/// has no pending `deadline` message on the advisory queue. The normal path
/// resolves a task past its deadline via that message; this scan exists
/// only to recover from the message itself having been lost.
pub async fn scan_unresolved_past_deadline(pool: &PgPool, now: DateTime<Utc>) -> Result<Vec<TaskWithRuns>> {
    let rows = sqlx::query_as::<_, TaskRow>(
        "SELECT t.* FROM tasks t \
         WHERE t.deadline <= $1 \
           AND NOT EXISTS ( \
               SELECT 1 FROM runs r \
               WHERE r.task_id = t.task_id \
               AND r.run_id = (SELECT MAX(run_id) FROM runs WHERE task_id = t.task_id) \
               AND r.state IN ('completed', 'failed', 'exception') \
           ) \
           AND NOT EXISTS ( \
               SELECT 1 FROM advisory_queue_messages q \
               WHERE q.queue = 'deadline' AND q.payload ->> 'taskId' = t.task_id \
           )",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to scan unresolved past-deadline tasks")?;

    let mut out = Vec::with_capacity(rows.len());
    for task in rows {
        let runs = sqlx::query_as::<_, RunRow>(
            "SELECT * FROM runs WHERE task_id = $1 ORDER BY run_id ASC",
        )
        .bind(&task.task_id)
        .fetch_all(pool)
        .await
        .context("failed to load runs for deadline sweep")?;
        out.push(TaskWithRuns { task, runs });
    }
    Ok(out)
}
