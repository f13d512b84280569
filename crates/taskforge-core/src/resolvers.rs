//! The three background resolver loops: claim-expiration,
//! deadline, and resolved. Each drains its advisory queue on a fixed poll
//! interval and is independently cancellable, so an operator can run all
//! three in one process or split them across hosts.
//!
//! Each loop is a `tokio::select!` between doing a batch of work and
//! `cancel.cancelled()`, so cancellation never waits out a full poll
//! interval.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value as Json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use taskforge_db::models::{ReasonCreated, ReasonResolved, RunState};
use taskforge_db::queries::tasks::NewRun;
use taskforge_db::queries::groups as group_db;
use taskforge_db::queries::queue;
use taskforge_db::queries::tasks as task_db;

use crate::config::EngineConfig;
use crate::dependency::DependencyTracker;
use crate::error::{EngineError, EngineResult};
use crate::event_bus::{self, EventSink, RoutingFields, Topic, TracingSink};
use crate::lifecycle::{emit_pending_shared, emit_resolution_shared, resolve_active_run_as_exception};

pub struct Resolvers<'a> {
    pool: &'a PgPool,
    config: &'a EngineConfig,
}

impl<'a> Resolvers<'a> {
    pub fn new(pool: &'a PgPool, config: &'a EngineConfig) -> Self {
        Self { pool, config }
    }

    /// Restart-recovery sweep: re-enqueue a claim-expiration message for
    /// every `running` run whose message is missing, so a crash between the
    /// `start_run` commit and the `claim-expiration` queue `put` cannot
    /// leave a running run with no path back to resolution. Run once before
    /// the three poll loops start.
    pub async fn recover_orphaned_claims(&self) -> EngineResult<usize> {
        let orphans = task_db::list_orphaned_running_runs(self.pool)
            .await
            .map_err(EngineError::Internal)?;
        let n = orphans.len();
        for orphan in &orphans {
            tracing::warn!(
                task_id = %orphan.task_id,
                run_id = orphan.run_id,
                "recovering orphaned running run with no claim-expiration message"
            );
            queue::put(
                self.pool,
                "claim-expiration",
                &serde_json::json!({ "taskId": orphan.task_id, "runId": orphan.run_id }),
                orphan.taken_until,
            )
            .await
            .map_err(EngineError::Internal)?;
        }
        Ok(n)
    }

    /// Restart-recovery sweep for the deadline resolver: re-enqueue a
    /// `deadline` message for every task whose deadline has already passed
    /// and whose last run is still non-terminal. The normal path enqueues
    /// this message at `createTask` time; this sweep
    /// covers the case where that message was lost (e.g. purged by an
    /// operator, or a restore from an older backup) rather than a crash in
    /// the creation path itself, since the message is queued before the
    /// task row is, so a crash between the two leaves no orphaned task.
    pub async fn recover_unresolved_deadlines(&self) -> EngineResult<usize> {
        let overdue = task_db::scan_unresolved_past_deadline(self.pool, Utc::now())
            .await
            .map_err(EngineError::Internal)?;
        let n = overdue.len();
        for task in &overdue {
            tracing::warn!(
                task_id = %task.task.task_id,
                "recovering unresolved task past its deadline with no pending deadline message"
            );
            queue::put(
                self.pool,
                "deadline",
                &serde_json::json!({ "taskId": task.task.task_id, "deadline": task.task.deadline }),
                Utc::now(),
            )
            .await
            .map_err(EngineError::Internal)?;
        }
        Ok(n)
    }

    /// Run the claim-expiration resolver until `cancel` fires.
    pub async fn run_claim_expiration(&self, cancel: &CancellationToken) -> EngineResult<()> {
        run_poll_loop(cancel, self.config.claim_resolver_poll, || self.drain_claim_expiration()).await
    }

    /// Run the deadline resolver until `cancel` fires.
    pub async fn run_deadline(&self, cancel: &CancellationToken) -> EngineResult<()> {
        run_poll_loop(cancel, self.config.deadline_resolver_poll, || self.drain_deadline()).await
    }

    /// Run the resolved resolver until `cancel` fires.
    pub async fn run_resolved(&self, cancel: &CancellationToken) -> EngineResult<()> {
        run_poll_loop(cancel, self.config.resolved_resolver_poll, || self.drain_resolved()).await
    }

    /// Run the event-outbox publisher until `cancel` fires, delivering to
    /// `sink` (the default deployment uses [`TracingSink`], since the real
    /// subscribers — notification/webhook adapters — are out-of-scope
    /// external collaborators).
    pub async fn run_event_publisher(&self, cancel: &CancellationToken, sink: &dyn EventSink) -> EngineResult<()> {
        run_poll_loop(cancel, self.config.event_publish_poll, || async {
            event_bus::drain_once(self.pool, sink, self.config.event_publish_batch)
                .await
                .map_err(EngineError::Internal)
        })
        .await
    }

    /// As [`Self::run_event_publisher`], defaulting to [`TracingSink`].
    pub async fn run_event_publisher_default(&self, cancel: &CancellationToken) -> EngineResult<()> {
        self.run_event_publisher(cancel, &TracingSink).await
    }

    async fn drain_claim_expiration(&self) -> EngineResult<usize> {
        let visibility = ChronoDuration::from_std(self.config.resolver_visibility_timeout)
            .map_err(|e| EngineError::Internal(e.into()))?;
        let messages = queue::receive(self.pool, "claim-expiration", self.config.claim_resolver_batch, visibility)
            .await
            .map_err(EngineError::Internal)?;

        let n = messages.len();
        for message in messages {
            if let Err(e) = self.handle_claim_expiration(&message.payload).await {
                tracing::error!(error = %e, "claim-expiration resolver failed to process message, leaving for retry");
                continue;
            }
            queue::delete(self.pool, message.id).await.map_err(EngineError::Internal)?;
        }
        Ok(n)
    }

    async fn handle_claim_expiration(&self, payload: &Json) -> EngineResult<()> {
        let (task_id, run_id) = task_and_run_id(payload)?;

        let Some(task) = task_db::load_task(self.pool, &task_id).await.map_err(EngineError::Internal)? else {
            return Ok(());
        };
        let Some(run) = task.runs.iter().find(|r| r.run_id == run_id) else {
            return Ok(());
        };
        if run.state != RunState::Running.to_string() {
            return Ok(());
        }

        let effective_taken_until = run.run_taken_until.unwrap_or(task.task.taken_until);
        if Utc::now() < effective_taken_until {
            // Reclaimed since this message was scheduled; not actually expired.
            return Ok(());
        }

        let resolved = task_db::resolve_run(
            self.pool,
            &task_id,
            run_id,
            &RunState::Exception.to_string(),
            &ReasonResolved::ClaimExpired.to_string(),
            Utc::now(),
        )
        .await
        .map_err(EngineError::Internal)?
        .ok_or_else(|| EngineError::ResourceNotFound(task_id.clone()))?;

        // A claim-expired run retries like any other exception whenever
        // the task still has retries left, rather than always
        // terminating the task — distinct from `reportException`, where
        // only `worker-shutdown`/`intermittent-task` reasons retry.
        if task.task.retries_left > 0 {
            let new_retries_left = task.task.retries_left - 1;
            let new_run_id = resolved.runs.len() as i32;
            let reason_created = if resolved.runs.len() == 1 {
                ReasonCreated::Retry
            } else {
                ReasonCreated::TaskRetry
            };
            let new_run = NewRun::pending(new_run_id, &reason_created.to_string(), Utc::now());
            let retried = task_db::append_run(self.pool, &task_id, &new_run, Some(new_retries_left))
                .await
                .map_err(EngineError::Internal)?
                .ok_or_else(|| EngineError::ResourceNotFound(task_id.clone()))?;
            emit_pending_shared(self.pool, &retried, new_run_id).await
        } else {
            emit_resolution_shared(self.pool, &resolved, run_id, RunState::Exception).await
        }
    }

    async fn drain_deadline(&self) -> EngineResult<usize> {
        let visibility = ChronoDuration::from_std(self.config.resolver_visibility_timeout)
            .map_err(|e| EngineError::Internal(e.into()))?;
        let messages = queue::receive(self.pool, "deadline", self.config.deadline_resolver_batch, visibility)
            .await
            .map_err(EngineError::Internal)?;

        let n = messages.len();
        for message in messages {
            if let Err(e) = self.handle_deadline(&message.payload).await {
                tracing::error!(error = %e, "deadline resolver failed to process message, leaving for retry");
                continue;
            }
            queue::delete(self.pool, message.id).await.map_err(EngineError::Internal)?;
        }
        Ok(n)
    }

    async fn handle_deadline(&self, payload: &Json) -> EngineResult<()> {
        let task_id = payload
            .get("taskId")
            .and_then(Json::as_str)
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("deadline message missing taskId")))?
            .to_owned();

        let Some(task) = task_db::load_task(self.pool, &task_id).await.map_err(EngineError::Internal)? else {
            return Ok(());
        };

        if let Some(last) = task.last_run() {
            if last.state.parse::<RunState>().map(RunState::is_terminal).unwrap_or(false) {
                return Ok(());
            }
        }

        if Utc::now() < task.task.deadline {
            return Ok(());
        }

        resolve_active_run_as_exception(self.pool, self.config, &task_id, ReasonResolved::DeadlineExceeded)
            .await?;
        Ok(())
    }

    async fn drain_resolved(&self) -> EngineResult<usize> {
        let visibility = ChronoDuration::from_std(self.config.resolver_visibility_timeout)
            .map_err(|e| EngineError::Internal(e.into()))?;
        let messages = queue::receive(self.pool, "resolved", self.config.resolved_resolver_batch, visibility)
            .await
            .map_err(EngineError::Internal)?;

        let n = messages.len();
        for message in messages {
            if let Err(e) = self.handle_resolved(&message.payload).await {
                tracing::error!(error = %e, "resolved resolver failed to process message, leaving for retry");
                continue;
            }
            queue::delete(self.pool, message.id).await.map_err(EngineError::Internal)?;
        }
        Ok(n)
    }

    async fn handle_resolved(&self, payload: &Json) -> EngineResult<()> {
        let task_id = payload
            .get("taskId")
            .and_then(Json::as_str)
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("resolved message missing taskId")))?
            .to_owned();
        let task_group_id = payload
            .get("taskGroupId")
            .and_then(Json::as_str)
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("resolved message missing taskGroupId")))?
            .to_owned();
        let scheduler_id = payload
            .get("schedulerId")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_owned();

        let Some(task) = task_db::load_task(self.pool, &task_id).await.map_err(EngineError::Internal)? else {
            return Ok(());
        };

        let tracker = DependencyTracker::new(self.pool, self.config);
        tracker.resolve_dependencies_of(&task).await?;

        let group_now_empty = group_db::remove_active_and_check_empty(self.pool, &task_group_id, &task_id)
            .await
            .map_err(EngineError::Internal)?;

        if group_now_empty {
            self.publish_task_group_resolved(&task_group_id, &scheduler_id).await?;
        }

        Ok(())
    }

    async fn publish_task_group_resolved(&self, task_group_id: &str, scheduler_id: &str) -> EngineResult<()> {
        let fields = RoutingFields {
            task_id: "_",
            run_id: None,
            worker_group: None,
            worker_id: None,
            provisioner_id: "_",
            worker_type: "_",
            scheduler_id,
            task_group_id,
            routes: &[],
        };
        let key = event_bus::build_routing_key(&fields);
        let payload = serde_json::json!({ "taskGroupId": task_group_id, "schedulerId": scheduler_id });
        event_bus::publish_pool(self.pool, Topic::TaskGroupResolved, &key, &[], payload)
            .await
            .map_err(EngineError::Internal)
    }
}

fn task_and_run_id(payload: &Json) -> EngineResult<(String, i32)> {
    let task_id = payload
        .get("taskId")
        .and_then(Json::as_str)
        .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("message missing taskId")))?
        .to_owned();
    let run_id = payload
        .get("runId")
        .and_then(Json::as_i64)
        .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("message missing runId")))? as i32;
    Ok((task_id, run_id))
}

/// Drive `work` on `poll_interval` until `cancel` fires. Errors from a
/// single `work` call are logged by the caller and do not stop the loop —
/// a resolver is a long-running process and one bad batch should not take
/// the whole thing down.
async fn run_poll_loop<F, Fut>(cancel: &CancellationToken, poll_interval: std::time::Duration, mut work: F) -> EngineResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<usize>>,
{
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        if let Err(e) = work().await {
            tracing::error!(error = %e, "resolver batch failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}
