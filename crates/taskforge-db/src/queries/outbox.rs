//! `EventBus` persistence: an at-least-once outbox. `write_pool` opens its
//! own transaction to insert a row, strictly after the Store write that
//! produced the transition has already committed through its own
//! transaction; rows are then drained by a background publisher and handed
//! to an `EventSink`.
//!
//! Modeled directly on the outbox-reader/writer split used for durable,
//! multi-consumer-safe delivery elsewhere in this workspace's
//! `advisory_queue_messages` table (see `queries::queue`), generalized from
//! a FIFO work queue to a fan-out publish log: `claim_unpublished` uses the
//! identical `FOR UPDATE SKIP LOCKED` idiom so two publisher instances never
//! race on the same row.

use anyhow::{Context, Result};
use serde_json::Value as Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::EventOutboxRow;

/// Write an outbox row inside the caller's open transaction.
pub async fn write(
    tx: &mut Transaction<'_, Postgres>,
    topic: &str,
    routing_key: &str,
    payload: &Json,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO event_outbox (topic, routing_key, payload) VALUES ($1, $2, $3)",
    )
    .bind(topic)
    .bind(routing_key)
    .bind(payload)
    .execute(&mut **tx)
    .await
    .context("failed to write event outbox row")?;
    Ok(())
}

/// Write an outbox row as its own transaction. Used by callers whose Store
/// write already committed through `taskforge_db::queries::tasks` (which
/// manages its own transaction internally) rather than one the caller
/// still holds open — the "emit side effects only after the successful
/// commit, carrying a local snapshot of what was committed" alternative
/// used for idempotency bookkeeping inside retries.
pub async fn write_pool(pool: &PgPool, topic: &str, routing_key: &str, payload: &Json) -> Result<()> {
    let mut tx = pool.begin().await.context("begin outbox write_pool txn")?;
    write(&mut tx, topic, routing_key, payload).await?;
    tx.commit().await.context("commit outbox write_pool txn")?;
    Ok(())
}

/// Claim up to `limit` unpublished rows for delivery, locking them so a
/// concurrent publisher does not also pick them up.
pub async fn claim_unpublished(pool: &PgPool, limit: i64) -> Result<Vec<EventOutboxRow>> {
    let rows = sqlx::query_as::<_, EventOutboxRow>(
        "SELECT * FROM event_outbox \
         WHERE published_at IS NULL \
         ORDER BY created_at ASC \
         LIMIT $1 \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to claim unpublished outbox rows")?;
    Ok(rows)
}

/// Mark a row published after the sink has accepted it.
pub async fn mark_published(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE event_outbox SET published_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark outbox row published")?;
    Ok(())
}
