//! `AdvisoryQueue` persistence: a durable FIFO per named
//! queue with visibility-timeout semantics. `receive` uses
//! `FOR UPDATE SKIP LOCKED` so concurrent long-pollers never hand out the
//! same message twice, which is what gives at-least-once (not exactly-once)
//! delivery its teeth — a crash between `receive` and `delete` simply lets
//! the row become visible again once `locked_until` elapses.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::QueueMessageRow;

/// Put a message onto `queue`, not visible to receivers until `visible_at`.
pub async fn put(pool: &PgPool, queue: &str, payload: &Json, visible_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO advisory_queue_messages (queue, payload, visible_at) VALUES ($1, $2, $3)",
    )
    .bind(queue)
    .bind(payload)
    .bind(visible_at)
    .execute(pool)
    .await
    .context("failed to put advisory queue message")?;
    Ok(())
}

/// Receive up to `max_messages` currently-visible messages from `queue`,
/// locking each for `visibility_timeout`. Messages already locked (in
/// flight to another receiver) are skipped.
pub async fn receive(
    pool: &PgPool,
    queue: &str,
    max_messages: i64,
    visibility_timeout: chrono::Duration,
) -> Result<Vec<QueueMessageRow>> {
    let mut tx = pool.begin().await.context("begin receive txn")?;

    let now = Utc::now();
    let locked_until = now + visibility_timeout;

    let ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM advisory_queue_messages \
         WHERE queue = $1 AND visible_at <= $2 \
           AND (locked_until IS NULL OR locked_until <= $2) \
         ORDER BY created_at ASC \
         LIMIT $3 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(queue)
    .bind(now)
    .bind(max_messages)
    .fetch_all(&mut *tx)
    .await
    .context("failed to select advisory queue messages")?;

    if ids.is_empty() {
        tx.commit().await.ok();
        return Ok(Vec::new());
    }

    sqlx::query("UPDATE advisory_queue_messages SET locked_until = $1 WHERE id = ANY($2)")
        .bind(locked_until)
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .context("failed to lock advisory queue messages")?;

    let rows = sqlx::query_as::<_, QueueMessageRow>(
        "SELECT * FROM advisory_queue_messages WHERE id = ANY($1) ORDER BY created_at ASC",
    )
    .bind(&ids)
    .fetch_all(&mut *tx)
    .await
    .context("failed to reload locked advisory queue messages")?;

    tx.commit().await.context("commit receive txn")?;

    Ok(rows)
}

/// Delete a message by its receipt (here, its row id) once the handler has
/// committed the corresponding state transition.
pub async fn delete(pool: &PgPool, receipt: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM advisory_queue_messages WHERE id = $1")
        .bind(receipt)
        .execute(pool)
        .await
        .context("failed to delete advisory queue message")?;
    Ok(())
}

/// Approximate count of visible-and-unlocked messages on `queue`. Callers
/// are expected to cache this for up to 20s themselves.
pub async fn count(pool: &PgPool, queue: &str) -> Result<i64> {
    let now = Utc::now();
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM advisory_queue_messages \
         WHERE queue = $1 AND visible_at <= $2 AND (locked_until IS NULL OR locked_until <= $2)",
    )
    .bind(queue)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to count advisory queue messages")?;
    Ok(n)
}
