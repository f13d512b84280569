//! Database query functions for `task_dependencies`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::TaskDependencyRow;

/// Insert the forward edge `dependent -> required`. Idempotent — a repeated
/// `createTask` retry inserts the same edges again harmlessly.
pub async fn insert_edge(
    pool: &PgPool,
    dependent_task_id: &str,
    required_task_id: &str,
    requires: &str,
    expires: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (dependent_task_id, required_task_id, requires, expires) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (dependent_task_id, required_task_id) DO NOTHING",
    )
    .bind(dependent_task_id)
    .bind(required_task_id)
    .bind(requires)
    .bind(expires)
    .execute(pool)
    .await
    .context("failed to insert task dependency edge")?;
    Ok(())
}

/// Forward edges for a dependent task (used by `trackDependencies` to
/// verify referenced tasks exist before writing edges).
pub async fn forward_edges(pool: &PgPool, dependent_task_id: &str) -> Result<Vec<TaskDependencyRow>> {
    let rows = sqlx::query_as::<_, TaskDependencyRow>(
        "SELECT * FROM task_dependencies WHERE dependent_task_id = $1",
    )
    .bind(dependent_task_id)
    .fetch_all(pool)
    .await
    .context("failed to load forward dependency edges")?;
    Ok(rows)
}

/// Atomically delete and return every reverse edge for `required_task_id` —
/// the edges naming it as a dependency. Deleting on read, rather than a
/// plain `SELECT`, is what makes `resolveDependenciesOf` safe under
/// at-least-once delivery: a redelivered `resolved` message finds no edges
/// left to fan out over, since the first delivery already consumed them, so
/// it decrements nothing a second time. `DELETE ... RETURNING` is a single
/// statement, so two concurrent deliveries racing on the same edge can never
/// both see it.
pub async fn take_reverse_edges(pool: &PgPool, required_task_id: &str) -> Result<Vec<TaskDependencyRow>> {
    let rows = sqlx::query_as::<_, TaskDependencyRow>(
        "DELETE FROM task_dependencies WHERE required_task_id = $1 RETURNING *",
    )
    .bind(required_task_id)
    .fetch_all(pool)
    .await
    .context("failed to take reverse dependency edges")?;
    Ok(rows)
}

/// Delete a single edge if it still exists, returning whether it did. Used
/// by `trackDependencies`' already-satisfied-at-creation-time shortcut,
/// which resolves an edge outside the normal `resolved`-message fan-out and
/// so needs the same consume-once guard against a concurrent
/// `resolveDependenciesOf` call racing it for the same edge.
pub async fn delete_edge(pool: &PgPool, dependent_task_id: &str, required_task_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "DELETE FROM task_dependencies WHERE dependent_task_id = $1 AND required_task_id = $2",
    )
    .bind(dependent_task_id)
    .bind(required_task_id)
    .execute(pool)
    .await
    .context("failed to delete task dependency edge")?;
    Ok(result.rows_affected() > 0)
}
