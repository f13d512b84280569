//! Database query functions for `task_groups`, `task_group_members`, and
//! `task_group_active_set`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::TaskGroupRow;

/// Conflicting `schedulerId` for an existing group, or a `TaskGroupMember`
/// collision with a different `expires`.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("task group {0} already belongs to a different schedulerId")]
    SchedulerMismatch(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Ensure a `TaskGroup` row exists with the given `scheduler_id`, extending
/// its `expires` to `max(current, new_expires)`. Returns `Err(SchedulerMismatch)`
/// if the group already exists under a different scheduler (maps to
/// `RequestConflict`).
pub async fn ensure_group(
    pool: &PgPool,
    task_group_id: &str,
    scheduler_id: &str,
    new_expires: DateTime<Utc>,
) -> std::result::Result<(), GroupError> {
    let mut tx = pool.begin().await.context("begin ensure_group txn")?;

    let existing = sqlx::query_as::<_, TaskGroupRow>(
        "SELECT * FROM task_groups WHERE task_group_id = $1 FOR UPDATE",
    )
    .bind(task_group_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to load task group")?;

    match existing {
        None => {
            sqlx::query(
                "INSERT INTO task_groups (task_group_id, scheduler_id, expires) VALUES ($1, $2, $3)",
            )
            .bind(task_group_id)
            .bind(scheduler_id)
            .bind(new_expires)
            .execute(&mut *tx)
            .await
            .context("failed to insert task group")?;
        }
        Some(group) => {
            if group.scheduler_id != scheduler_id {
                return Err(GroupError::SchedulerMismatch(task_group_id.to_owned()));
            }
            if new_expires > group.expires {
                sqlx::query("UPDATE task_groups SET expires = $1 WHERE task_group_id = $2")
                    .bind(new_expires)
                    .bind(task_group_id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to extend task group expires")?;
            }
        }
    }

    tx.commit().await.context("commit ensure_group txn")?;
    Ok(())
}

pub async fn load_group(pool: &PgPool, task_group_id: &str) -> Result<Option<TaskGroupRow>> {
    let row = sqlx::query_as::<_, TaskGroupRow>("SELECT * FROM task_groups WHERE task_group_id = $1")
        .bind(task_group_id)
        .fetch_optional(pool)
        .await
        .context("failed to load task group")?;
    Ok(row)
}

/// Insert the permanent-for-expiry membership row. Idempotent.
pub async fn insert_member(pool: &PgPool, task_group_id: &str, task_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_group_members (task_group_id, task_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_group_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to insert task group member")?;
    Ok(())
}

/// Insert the task into the active set (removed again on resolution).
/// A pre-existing row is fine (idempotent create retry); this function
/// never rejects on conflict since the active-set row carries no data of
/// its own to disagree about — the `expires`-mismatch conflict check
/// happens at the membership layer via the task row itself, not here.
pub async fn insert_active(pool: &PgPool, task_group_id: &str, task_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_group_active_set (task_group_id, task_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_group_id)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to insert task group active entry")?;
    Ok(())
}

/// Remove a task from the active set on resolution. Returns whether the
/// active set is now empty (the `task-group-resolved` signal, provided the
/// group has at least one member).
pub async fn remove_active_and_check_empty(
    pool: &PgPool,
    task_group_id: &str,
    task_id: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("begin remove_active txn")?;

    sqlx::query(
        "DELETE FROM task_group_active_set WHERE task_group_id = $1 AND task_id = $2",
    )
    .bind(task_group_id)
    .bind(task_id)
    .execute(&mut *tx)
    .await
    .context("failed to remove task group active entry")?;

    let remaining: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM task_group_active_set WHERE task_group_id = $1",
    )
    .bind(task_group_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to count remaining active entries")?;

    let has_members: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM task_group_members WHERE task_group_id = $1)",
    )
    .bind(task_group_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to check task group members")?;

    tx.commit().await.context("commit remove_active txn")?;

    Ok(remaining == 0 && has_members)
}
