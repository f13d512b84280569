//! `WorkClaimer`: `claim`'s long-poll fan-out across priority
//! buckets, `reclaim`, and a TTL-cached `pendingCount`.
//!
//! `claim`'s poll-drain-or-wait shape: drain what's ready, else wait on a
//! cancellable sleep for the next pending message to become visible, using
//! a `tokio_util::sync::CancellationToken` for cooperative shutdown.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value as Json;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use taskforge_db::ids;
use taskforge_db::models::{Priority, RunState, TaskWithRuns};
use taskforge_db::queries::queue;
use taskforge_db::queries::tasks as task_db;

use crate::config::EngineConfig;
use crate::credential::{generate_credential, CredentialConfig};
use crate::error::{EngineError, EngineResult};
use crate::event_bus::{self, RoutingFields, Topic};
use crate::worker_registry::WorkerRegistry;

/// How often `claim`'s long-poll re-checks every priority bucket while
/// waiting for a message to become visible.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One run handed to a worker by `claim`, with its scoped credential.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub task: TaskWithRuns,
    pub run_id: i32,
    pub credential: String,
}

pub struct WorkClaimer<'a> {
    pool: &'a PgPool,
    config: &'a EngineConfig,
    credential_config: &'a CredentialConfig,
}

impl<'a> WorkClaimer<'a> {
    pub fn new(pool: &'a PgPool, config: &'a EngineConfig, credential_config: &'a CredentialConfig) -> Self {
        Self { pool, config, credential_config }
    }

    /// `claim`: long-poll up to `count` pending runs for
    /// `(provisionerId, workerType)`, draining priority buckets
    /// highest-first, for up to `claim_long_poll` or until `cancel` fires.
    /// Returns fewer than `count` (possibly zero) if the poll window closes
    /// first — callers treat a short result as "nothing more right now,"
    /// not an error.
    ///
    /// Step 1 checks `WorkerRegistry::is_quarantined` before anything else;
    /// a quarantined worker still records as seen, then sleeps out the same
    /// `claim_long_poll` window as an empty poll rather than returning
    /// immediately, so a caller polling in a loop backs off the same way it
    /// would against an empty queue instead of hot-looping.
    pub async fn claim(
        &self,
        provisioner_id: &str,
        worker_type: &str,
        worker_group: &str,
        worker_id: &str,
        count: i64,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<ClaimedRun>> {
        if !ids::is_valid_generic_id(provisioner_id) {
            return Err(EngineError::InputError(format!("malformed provisionerId: {provisioner_id}")));
        }
        if !ids::is_valid_generic_id(worker_type) {
            return Err(EngineError::InputError(format!("malformed workerType: {worker_type}")));
        }
        if !ids::is_valid_generic_id(worker_group) {
            return Err(EngineError::InputError(format!("malformed workerGroup: {worker_group}")));
        }
        if !ids::is_valid_generic_id(worker_id) {
            return Err(EngineError::InputError(format!("malformed workerId: {worker_id}")));
        }

        let registry = WorkerRegistry::new(self.pool, self.config);
        if registry.is_quarantined(provisioner_id, worker_type, worker_group, worker_id).await? {
            registry.record_seen(provisioner_id, worker_type, worker_group, worker_id).await?;
            tokio::select! {
                _ = tokio::time::sleep(self.config.claim_long_poll) => {}
                _ = cancel.cancelled() => {}
            }
            return Ok(Vec::new());
        }

        if count <= 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + self.config.claim_long_poll;
        let mut claimed = Vec::new();

        loop {
            for priority in Priority::ALL {
                let remaining = count - claimed.len() as i64;
                if remaining <= 0 {
                    break;
                }
                let queue_name = format!("pending/{provisioner_id}/{worker_type}/{priority}");
                let visibility = ChronoDuration::from_std(self.config.claim_timeout)
                    .map_err(|e| EngineError::Internal(e.into()))?;
                let messages = queue::receive(self.pool, &queue_name, remaining, visibility)
                    .await
                    .map_err(EngineError::Internal)?;

                for message in messages {
                    let outcome = self.try_start(&message.payload, worker_group, worker_id).await?;
                    queue::delete(self.pool, message.id).await.map_err(EngineError::Internal)?;
                    if let Some(run) = outcome {
                        claimed.push(run);
                    }
                }
            }

            if claimed.len() as i64 >= count || Instant::now() >= deadline || cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => break,
            }
        }

        Ok(claimed)
    }

    /// Attempt to transition the run named by a pending-queue payload into
    /// `running`. Returns `None` for a stale message (the run moved on
    /// already — e.g. it was cancelled between enqueue and claim), which
    /// the caller drops without surfacing an error: stale messages are an
    /// expected consequence of at-least-once delivery, not a fault.
    async fn try_start(&self, payload: &Json, worker_group: &str, worker_id: &str) -> EngineResult<Option<ClaimedRun>> {
        let task_id = payload
            .get("taskId")
            .and_then(Json::as_str)
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("pending message missing taskId")))?;
        let run_id = payload
            .get("runId")
            .and_then(Json::as_i64)
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("pending message missing runId")))? as i32;

        let Some(task) = task_db::load_task(self.pool, task_id).await.map_err(EngineError::Internal)? else {
            return Ok(None);
        };
        let Some(run) = task.runs.iter().find(|r| r.run_id == run_id) else {
            return Ok(None);
        };
        if run.state != RunState::Pending.to_string() {
            return Ok(None);
        }

        let now = Utc::now();
        let taken_until = now + self.config.claim_timeout;
        let Some(updated) = task_db::start_run(self.pool, task_id, run_id, worker_group, worker_id, now, taken_until)
            .await
            .map_err(EngineError::Internal)?
        else {
            return Ok(None);
        };

        self.publish_task_running(&updated, run_id, worker_group, worker_id).await?;

        queue::put(
            self.pool,
            "claim-expiration",
            &serde_json::json!({ "taskId": task_id, "runId": run_id }),
            taken_until,
        )
        .await
        .map_err(EngineError::Internal)?;

        let credential = generate_credential(self.credential_config, task_id, run_id);
        Ok(Some(ClaimedRun { task: updated, run_id, credential }))
    }

    async fn publish_task_running(
        &self,
        task: &TaskWithRuns,
        run_id: i32,
        worker_group: &str,
        worker_id: &str,
    ) -> EngineResult<()> {
        let routes: Vec<String> = serde_json::from_value(task.task.routes.clone()).unwrap_or_default();
        let fields = RoutingFields {
            task_id: &task.task.task_id,
            run_id: Some(run_id),
            worker_group: Some(worker_group),
            worker_id: Some(worker_id),
            provisioner_id: &task.task.provisioner_id,
            worker_type: &task.task.worker_type,
            scheduler_id: &task.task.scheduler_id,
            task_group_id: &task.task.task_group_id,
            routes: &routes,
        };
        let key = event_bus::build_routing_key(&fields);
        let cc = event_bus::route_cc_keys(&routes);
        let payload = serde_json::json!({
            "taskId": task.task.task_id,
            "runId": run_id,
            "workerGroup": worker_group,
            "workerId": worker_id,
        });
        event_bus::publish_pool(self.pool, Topic::TaskRunning, &key, &cc, payload)
            .await
            .map_err(EngineError::Internal)
    }

    /// `reclaim`: extend a running run's `takenUntil`.
    /// Rejects an owner mismatch and a `takenUntil` that does not strictly
    /// advance (`RequestConflict`).
    pub async fn reclaim(
        &self,
        task_id: &str,
        run_id: i32,
        worker_group: &str,
        worker_id: &str,
        new_taken_until: chrono::DateTime<Utc>,
    ) -> EngineResult<TaskWithRuns> {
        let task = task_db::load_task(self.pool, task_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;

        let run = task
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| EngineError::ResourceNotFound(format!("{task_id}/{run_id}")))?;

        if run.state != RunState::Running.to_string()
            || run.worker_group.as_deref() != Some(worker_group)
            || run.worker_id.as_deref() != Some(worker_id)
        {
            return Err(EngineError::RequestConflict(format!(
                "run {task_id}/{run_id} is not running, or is not held by {worker_group}/{worker_id}"
            )));
        }

        let current_taken_until = run.run_taken_until.unwrap_or(task.task.taken_until);
        if new_taken_until <= current_taken_until {
            return Err(EngineError::RequestConflict(
                "reclaim must strictly advance takenUntil".to_owned(),
            ));
        }

        task_db::refresh_taken_until(self.pool, task_id, run_id, new_taken_until)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))
    }
}

/// TTL-cached `pendingCount`: `AdvisoryQueue::count` is
/// allowed up to `pending_count_cache_ttl` of staleness, so a dashboard
/// polling it every few seconds does not hammer the database with a
/// `COUNT(*)` per request.
pub struct PendingCountCache {
    ttl: Duration,
    cached: RwLock<Option<(Instant, i64)>>,
}

impl PendingCountCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, cached: RwLock::new(None) }
    }

    pub async fn count(&self, pool: &PgPool, provisioner_id: &str, worker_type: &str, priority: Priority) -> EngineResult<i64> {
        {
            let guard = self.cached.read().await;
            if let Some((fetched_at, value)) = *guard {
                if fetched_at.elapsed() < self.ttl {
                    return Ok(value);
                }
            }
        }

        let queue_name = format!("pending/{provisioner_id}/{worker_type}/{priority}");
        let value = queue::count(pool, &queue_name).await.map_err(EngineError::Internal)?;
        *self.cached.write().await = Some((Instant::now(), value));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_run_carries_credential() {
        // Construction-only smoke test; the actual claim path needs a
        // database and is covered by the integration suite.
        let cfg = CredentialConfig::new(b"k".to_vec());
        let credential = generate_credential(&cfg, "AAAAAAAAQAAAAAAAAAAAAQ", 0);
        assert!(credential.starts_with("taskforge_rc_"));
    }
}
