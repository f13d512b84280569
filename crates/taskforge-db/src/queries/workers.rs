//! Database query functions for `workers` (`WorkerRegistry`):
//! liveness, quarantine, and a bounded ring of recently-claimed task IDs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Value as Json, json};
use sqlx::PgPool;

use crate::models::WorkerRow;

/// Record that a worker was seen (claim call, successful or not), creating
/// the row on first sight.
pub async fn record_seen(
    pool: &PgPool,
    provisioner_id: &str,
    worker_type: &str,
    worker_group: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO workers (provisioner_id, worker_type, worker_group, worker_id, last_seen) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (provisioner_id, worker_type, worker_group, worker_id) \
         DO UPDATE SET last_seen = EXCLUDED.last_seen",
    )
    .bind(provisioner_id)
    .bind(worker_type)
    .bind(worker_group)
    .bind(worker_id)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to record worker seen")?;
    Ok(())
}

pub async fn load(
    pool: &PgPool,
    provisioner_id: &str,
    worker_type: &str,
    worker_group: &str,
    worker_id: &str,
) -> Result<Option<WorkerRow>> {
    let row = sqlx::query_as::<_, WorkerRow>(
        "SELECT * FROM workers \
         WHERE provisioner_id = $1 AND worker_type = $2 AND worker_group = $3 AND worker_id = $4",
    )
    .bind(provisioner_id)
    .bind(worker_type)
    .bind(worker_group)
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("failed to load worker")?;
    Ok(row)
}

pub async fn quarantine_until(
    pool: &PgPool,
    provisioner_id: &str,
    worker_type: &str,
    worker_group: &str,
    worker_id: &str,
    until: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE workers SET quarantine_until = $1 \
         WHERE provisioner_id = $2 AND worker_type = $3 AND worker_group = $4 AND worker_id = $5",
    )
    .bind(until)
    .bind(provisioner_id)
    .bind(worker_type)
    .bind(worker_group)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to set worker quarantine")?;
    Ok(())
}

/// Push a claimed task ID onto the worker's recent-task ring, bounded to
/// `cap` entries (oldest dropped first).
pub async fn push_recent_task(
    pool: &PgPool,
    provisioner_id: &str,
    worker_type: &str,
    worker_group: &str,
    worker_id: &str,
    task_id: &str,
    cap: usize,
) -> Result<()> {
    let existing = load(pool, provisioner_id, worker_type, worker_group, worker_id).await?;
    let mut ring: Vec<String> = existing
        .and_then(|w| serde_json::from_value(w.recent_task_ids).ok())
        .unwrap_or_default();

    ring.push(task_id.to_owned());
    while ring.len() > cap {
        ring.remove(0);
    }

    let payload: Json = json!(ring);

    sqlx::query(
        "UPDATE workers SET recent_task_ids = $1 \
         WHERE provisioner_id = $2 AND worker_type = $3 AND worker_group = $4 AND worker_id = $5",
    )
    .bind(&payload)
    .bind(provisioner_id)
    .bind(worker_type)
    .bind(worker_group)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to push worker recent task")?;
    Ok(())
}
