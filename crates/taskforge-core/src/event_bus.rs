//! `EventBus`: topic publish with a structured routing key,
//! at-least-once, outbox-backed.
//!
//! `publish_pool` writes a row to `event_outbox` in its own transaction,
//! opened strictly after the Store write that produced the event has
//! already committed through its own `taskforge_db::queries` helper — every
//! call site in this crate manages its Store write and outbox write as two
//! separate transactions rather than one, so a crash between them can leave
//! a Store mutation with no corresponding event (an accepted gap; nothing
//! currently re-derives missed events from Store state, unlike the
//! dependency-edge and claim-expiration paths, which re-read and tolerate
//! redelivery instead). A background publisher — `EventBus::drain_once`,
//! called in a loop by whichever resolver host runs it — claims unpublished
//! rows and hands them to a pluggable [`EventSink`]. This mirrors the
//! `advisory_queue_messages` outbox pattern in `taskforge_db::queries::outbox`
//! almost verbatim, adapted from a FIFO work queue to a fan-out publish log.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value as Json;
use sqlx::PgPool;
use tracing::info;

use taskforge_db::queries::outbox;

/// Topics the engine publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    TaskDefined,
    TaskPending,
    TaskRunning,
    TaskCompleted,
    TaskFailed,
    TaskException,
    TaskGroupResolved,
    ArtifactCreated,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::TaskDefined => "task-defined",
            Topic::TaskPending => "task-pending",
            Topic::TaskRunning => "task-running",
            Topic::TaskCompleted => "task-completed",
            Topic::TaskFailed => "task-failed",
            Topic::TaskException => "task-exception",
            Topic::TaskGroupResolved => "task-group-resolved",
            Topic::ArtifactCreated => "artifact-created",
        }
    }
}

/// The fields the primary routing key is built from:
/// `(taskId, runId|"_", workerGroup|"_", workerId|"_", provisionerId,
/// workerType, schedulerId, taskGroupId)`, joined by dots, with a trailing
/// reserved `#` segment always present for topic-exchange wildcard binds.
#[derive(Debug, Clone)]
pub struct RoutingFields<'a> {
    pub task_id: &'a str,
    pub run_id: Option<i32>,
    pub worker_group: Option<&'a str>,
    pub worker_id: Option<&'a str>,
    pub provisioner_id: &'a str,
    pub worker_type: &'a str,
    pub scheduler_id: &'a str,
    pub task_group_id: &'a str,
    /// Additional `route.<r>` CC keys, one per `task.routes` entry.
    /// Not part of the primary key; returned alongside it
    /// by [`build_routing_key`]'s caller as the CC key list.
    pub routes: &'a [String],
}

fn seg(s: Option<&str>) -> &str {
    s.unwrap_or("_")
}

/// Build the primary routing key for an event.
pub fn build_routing_key(fields: &RoutingFields<'_>) -> String {
    let run_id = fields.run_id.map(|r| r.to_string());
    format!(
        "{}.{}.{}.{}.{}.{}.{}.{}.#",
        fields.task_id,
        seg(run_id.as_deref()),
        seg(fields.worker_group),
        seg(fields.worker_id),
        fields.provisioner_id,
        fields.worker_type,
        fields.scheduler_id,
        fields.task_group_id,
    )
}

/// The additional `route.<r>` CC keys a caller must publish alongside the
/// primary routing key, one per entry in `task.routes`.
pub fn route_cc_keys(routes: &[String]) -> Vec<String> {
    routes.iter().map(|r| format!("route.{r}")).collect()
}

/// One delivered event, handed to an [`EventSink`].
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: &'static str,
    pub routing_key: String,
    pub cc_keys: Vec<String>,
    pub payload: Json,
}

/// Pluggable delivery target for drained outbox events. The default is
/// `tracing`-logged (adequate for a system whose actual subscribers are
/// out-of-scope external collaborators); tests use an in-memory recording
/// sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<()>;
}

/// Default sink: logs every delivered event via `tracing`.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn deliver(&self, event: &Event) -> Result<()> {
        info!(
            topic = event.topic,
            routing_key = %event.routing_key,
            cc_keys = ?event.cc_keys,
            "event published"
        );
        Ok(())
    }
}

/// Write one event to the outbox in its own transaction, strictly after
/// the Store write that produced it has committed. `cc_keys` are folded
/// into the stored payload under `_cc` since the outbox table has a single
/// `routing_key` column; `drain_once` splits them back out when handing the
/// event to a sink.
pub async fn publish_pool(
    pool: &PgPool,
    topic: Topic,
    routing_key: &str,
    cc_keys: &[String],
    mut payload: Json,
) -> Result<()> {
    if let Json::Object(ref mut map) = payload {
        map.insert("_cc".to_owned(), serde_json::json!(cc_keys));
    }
    outbox::write_pool(pool, topic.as_str(), routing_key, &payload)
        .await
        .context("failed to write event outbox row")
}

/// Drain up to `limit` unpublished outbox rows and hand each to `sink`,
/// marking it published on success. Rows whose sink delivery fails are
/// left unpublished for the next drain call (at-least-once delivery).
pub async fn drain_once(pool: &PgPool, sink: &dyn EventSink, limit: i64) -> Result<usize> {
    let rows = outbox::claim_unpublished(pool, limit)
        .await
        .context("failed to claim unpublished outbox rows")?;

    let mut delivered = 0;
    for row in rows {
        let mut payload = row.payload;
        let cc_keys: Vec<String> = if let Json::Object(ref mut map) = payload {
            map.remove("_cc")
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let event = Event {
            topic: leak_topic(&row.topic),
            routing_key: row.routing_key,
            cc_keys,
            payload,
        };

        match sink.deliver(&event).await {
            Ok(()) => {
                outbox::mark_published(pool, row.id).await?;
                delivered += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, topic = event.topic, "event sink delivery failed, will retry");
            }
        }
    }
    Ok(delivered)
}

/// `Event::topic` is `&'static str` for cheap copies in hot paths; the
/// outbox only ever contains the eight topic strings this crate itself
/// wrote, so matching back to a static is exhaustive and infallible.
fn leak_topic(topic: &str) -> &'static str {
    match topic {
        "task-defined" => Topic::TaskDefined.as_str(),
        "task-pending" => Topic::TaskPending.as_str(),
        "task-running" => Topic::TaskRunning.as_str(),
        "task-completed" => Topic::TaskCompleted.as_str(),
        "task-failed" => Topic::TaskFailed.as_str(),
        "task-exception" => Topic::TaskException.as_str(),
        "task-group-resolved" => Topic::TaskGroupResolved.as_str(),
        "artifact-created" => Topic::ArtifactCreated.as_str(),
        _ => "unknown",
    }
}

/// In-memory recording sink for tests: records every delivered event.
pub struct RecordingSink {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            events: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    pub async fn topics(&self) -> Vec<&'static str> {
        self.events.lock().await.iter().map(|e| e.topic).collect()
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, event: &Event) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_key_placeholders_for_absent_fields() {
        let fields = RoutingFields {
            task_id: "T1",
            run_id: None,
            worker_group: None,
            worker_id: None,
            provisioner_id: "prov",
            worker_type: "wtype",
            scheduler_id: "sched",
            task_group_id: "G1",
            routes: &[],
        };
        assert_eq!(
            build_routing_key(&fields),
            "T1._._._.prov.wtype.sched.G1.#"
        );
    }

    #[test]
    fn routing_key_fills_present_fields() {
        let fields = RoutingFields {
            task_id: "T1",
            run_id: Some(3),
            worker_group: Some("wg"),
            worker_id: Some("w1"),
            provisioner_id: "prov",
            worker_type: "wtype",
            scheduler_id: "sched",
            task_group_id: "G1",
            routes: &[],
        };
        assert_eq!(
            build_routing_key(&fields),
            "T1.3.wg.w1.prov.wtype.sched.G1.#"
        );
    }

    #[test]
    fn route_cc_keys_prefixed() {
        let routes = vec!["a.b".to_owned(), "c".to_owned()];
        assert_eq!(route_cc_keys(&routes), vec!["route.a.b", "route.c"]);
    }
}
