//! Database query functions for `artifacts`.
//!
//! The core never inspects artifact contents; it only reads the `present`
//! flag to gate `reportCompleted`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::ArtifactRow;

/// Upsert an artifact record (the out-of-scope storage collaborator calls
/// this when it finishes uploading; the core only reads it back).
pub async fn upsert(
    pool: &PgPool,
    task_id: &str,
    run_id: i32,
    name: &str,
    storage_type: &str,
    expires: DateTime<Utc>,
    present: bool,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO artifacts (task_id, run_id, name, storage_type, expires, present) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (task_id, run_id, name) \
         DO UPDATE SET storage_type = EXCLUDED.storage_type, expires = EXCLUDED.expires, \
                       present = EXCLUDED.present",
    )
    .bind(task_id)
    .bind(run_id)
    .bind(name)
    .bind(storage_type)
    .bind(expires)
    .bind(present)
    .execute(pool)
    .await
    .context("failed to upsert artifact")?;
    Ok(())
}

/// All artifacts recorded for a given run.
pub async fn for_run(pool: &PgPool, task_id: &str, run_id: i32) -> Result<Vec<ArtifactRow>> {
    let rows = sqlx::query_as::<_, ArtifactRow>(
        "SELECT * FROM artifacts WHERE task_id = $1 AND run_id = $2",
    )
    .bind(task_id)
    .bind(run_id)
    .fetch_all(pool)
    .await
    .context("failed to load artifacts for run")?;
    Ok(rows)
}

/// Whether every `object`-storage-type artifact for a run has `present =
/// true` — the precondition `reportCompleted` checks before committing.
pub async fn all_object_artifacts_present(pool: &PgPool, task_id: &str, run_id: i32) -> Result<bool> {
    let missing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM artifacts \
         WHERE task_id = $1 AND run_id = $2 AND storage_type = 'object' AND present = FALSE",
    )
    .bind(task_id)
    .bind(run_id)
    .fetch_one(pool)
    .await
    .context("failed to check object artifact presence")?;
    Ok(missing == 0)
}
