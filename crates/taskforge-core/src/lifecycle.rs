//! `TaskLifecycle`: the user-visible create/schedule/rerun/
//! cancel/report* operations, all idempotent on their key inputs.
//!
//! Splits transition validity from the transition driver
//! (`is_valid_transition`/`transition`/`retry_transition`-style methods)
//! against a run-sequence model rather than a single status column, and
//! `create`'s ten-step procedure follows a validate -> persist -> link
//! dependents -> emit pipeline shape.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Value as Json, json};
use sqlx::PgPool;

use taskforge_db::models::{
    Priority, ReasonCreated, ReasonResolved, RequiresMode, RunState, TaskRow, TaskWithRuns,
};
use taskforge_db::queries::tasks::{self as task_db, CreateTaskError, NewRun, NewTaskRow};
use taskforge_db::queries::groups as group_db;
use taskforge_db::queries::groups::GroupError;
use taskforge_db::{ids, queries::queue};

use crate::config::EngineConfig;
use crate::dependency::DependencyTracker;
use crate::error::{EngineError, EngineResult};
use crate::event_bus::{self, RoutingFields, Topic};

/// Caller-supplied definition for `createTask`/`defineTask`.
/// `payload`/`metadata`/`tags` are opaque JSON the core never inspects and
/// must round-trip byte-identically for idempotency comparisons.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub provisioner_id: String,
    pub worker_type: String,
    pub scheduler_id: String,
    pub task_group_id: String,
    pub scopes: Vec<String>,
    pub routes: Vec<String>,
    pub dependencies: Vec<String>,
    pub requires: RequiresMode,
    pub priority: Priority,
    pub retries: i32,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// `None` means "use `deadline + default_expires_offset`".
    pub expires: Option<DateTime<Utc>>,
    pub payload: Json,
    pub metadata: Json,
    pub tags: Json,
}

pub struct TaskLifecycle<'a> {
    pool: &'a PgPool,
    config: &'a EngineConfig,
}

impl<'a> TaskLifecycle<'a> {
    pub fn new(pool: &'a PgPool, config: &'a EngineConfig) -> Self {
        Self { pool, config }
    }

    /// `createTask`.
    pub async fn create(&self, task_id: &str, def: TaskDefinition) -> EngineResult<TaskWithRuns> {
        self.create_impl(task_id, def, false).await
    }

    /// `defineTask`: identical to `create` except the task
    /// gains a self-dependency so it always starts `unscheduled`, and no
    /// `task-pending` event is ever emitted for run 0 (there never is one).
    pub async fn define_task(&self, task_id: &str, def: TaskDefinition) -> EngineResult<TaskWithRuns> {
        self.create_impl(task_id, def, true).await
    }

    async fn create_impl(
        &self,
        task_id: &str,
        mut def: TaskDefinition,
        self_dependency: bool,
    ) -> EngineResult<TaskWithRuns> {
        if !ids::is_valid_task_id(task_id) {
            return Err(EngineError::InputError(format!("malformed taskId: {task_id}")));
        }
        if !ids::is_valid_task_id(&def.task_group_id) {
            return Err(EngineError::InputError(format!(
                "malformed taskGroupId: {}",
                def.task_group_id
            )));
        }

        // Step 1: scopes ending in `**` are rejected.
        if def.scopes.iter().any(|s| s.ends_with("**")) {
            return Err(EngineError::InputError(
                "scopes ending in '**' are not permitted".to_owned(),
            ));
        }

        // Step 2: timestamp validation and normalization.
        let now = Utc::now();
        let skew = ChronoDuration::from_std(self.config.created_skew)
            .map_err(|e| EngineError::Internal(e.into()))?;
        if (def.created - now).abs() > skew {
            return Err(EngineError::InputError(format!(
                "created {} is outside the allowed {:?} skew from now",
                def.created, self.config.created_skew
            )));
        }
        if def.deadline <= now {
            return Err(EngineError::InputError("deadline must be in the future".to_owned()));
        }
        let max_horizon = ChronoDuration::from_std(self.config.max_deadline_horizon)
            .map_err(|e| EngineError::Internal(e.into()))?
            + ChronoDuration::from_std(self.config.drift_allowance)
                .map_err(|e| EngineError::Internal(e.into()))?;
        if def.deadline - def.created > max_horizon {
            return Err(EngineError::InputError(
                "deadline exceeds the maximum horizon past created".to_owned(),
            ));
        }
        let default_offset = ChronoDuration::from_std(self.config.default_expires_offset)
            .map_err(|e| EngineError::Internal(e.into()))?;
        let expires = def.expires.unwrap_or(def.deadline + default_offset);
        if expires < def.deadline {
            return Err(EngineError::InputError("expires must be >= deadline".to_owned()));
        }
        def.expires = Some(expires);

        // Step 3: priority normalization (the FromStr alias already maps
        // "normal" to Lowest for callers parsing from wire text; this
        // handles a Priority constructed any other way).
        let priority = def.priority;

        // Step 4/5: task group membership.
        let group_extension = ChronoDuration::from_std(self.config.task_group_expires_extension)
            .map_err(|e| EngineError::Internal(e.into()))?;
        match group_db::ensure_group(self.pool, &def.task_group_id, &def.scheduler_id, expires + group_extension).await {
            Ok(()) => {}
            Err(GroupError::SchedulerMismatch(group)) => {
                return Err(EngineError::RequestConflict(format!(
                    "task group {group} belongs to a different schedulerId"
                )));
            }
            Err(GroupError::Other(e)) => return Err(EngineError::Internal(e)),
        }
        group_db::insert_member(self.pool, &def.task_group_id, task_id)
            .await
            .map_err(EngineError::Internal)?;
        group_db::insert_active(self.pool, &def.task_group_id, task_id)
            .await
            .map_err(EngineError::Internal)?;

        // Step 6: deadline advisory message.
        queue::put(
            self.pool,
            "deadline",
            &json!({ "taskId": task_id, "deadline": def.deadline }),
            def.deadline,
        )
        .await
        .map_err(EngineError::Internal)?;

        // Step 7: insert the task row, plus run 0 if it starts scheduled.
        let has_dependencies = !def.dependencies.is_empty() || self_dependency;
        let first_run = if has_dependencies {
            None
        } else {
            Some(NewRun::pending(0, &ReasonCreated::Scheduled.to_string(), now))
        };

        let new_row = NewTaskRow {
            task_id: task_id.to_owned(),
            provisioner_id: def.provisioner_id.clone(),
            worker_type: def.worker_type.clone(),
            scheduler_id: def.scheduler_id.clone(),
            task_group_id: def.task_group_id.clone(),
            requires: def.requires.to_string(),
            priority: priority.to_string(),
            retries: def.retries,
            created: def.created,
            deadline: def.deadline,
            expires,
            scopes: json!(def.scopes),
            routes: json!(def.routes),
            tags: def.tags.clone(),
            payload: def.payload.clone(),
            metadata_extra: def.metadata.clone(),
            unresolved_deps: def.dependencies.len() as i32 + if self_dependency { 1 } else { 0 },
        };

        let task = match task_db::create_task(self.pool, &new_row, first_run.as_ref()).await {
            Ok(task) => task,
            Err(CreateTaskError::AlreadyExists) => {
                return self.reconcile_existing(task_id, &new_row).await;
            }
            Err(CreateTaskError::Other(e)) => return Err(EngineError::Internal(e)),
        };

        // Step 9: wire up dependencies if the task starts unscheduled.
        if has_dependencies {
            let mut deps = def.dependencies.clone();
            if self_dependency {
                deps.push(task_id.to_owned());
            }
            let tracker = DependencyTracker::new(self.pool, self.config);
            tracker
                .track_dependencies(&task, &deps, def.requires, expires)
                .await?;
        }

        // Step 10: publish task-defined (always), then task-pending if run
        // 0 started pending, in that order.
        self.publish_task_defined(&task).await?;
        if !has_dependencies {
            self.emit_pending(&task, 0).await?;
        }

        task_db::load_task(self.pool, task_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("task vanished after create")))
    }

    async fn reconcile_existing(&self, task_id: &str, attempted: &NewTaskRow) -> EngineResult<TaskWithRuns> {
        let existing = task_db::load_task(self.pool, task_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("task disappeared mid-reconcile")))?;

        if definitions_match(&existing.task, attempted) {
            Ok(existing)
        } else {
            Err(EngineError::RequestConflict(format!(
                "task {task_id} already exists with a different definition"
            )))
        }
    }

    /// `scheduleTask`: force-schedules regardless of
    /// dependency state. Delegates to `DependencyTracker::schedule_task`,
    /// which is the single idempotent "append run 0 if unscheduled" path
    /// shared with dependency resolution.
    pub async fn schedule_task(&self, task_id: &str) -> EngineResult<TaskWithRuns> {
        let tracker = DependencyTracker::new(self.pool, self.config);
        match tracker.schedule_task(task_id).await? {
            Some(task) => Ok(task),
            None => Err(EngineError::RequestConflict(format!(
                "task {task_id} is past its deadline"
            ))),
        }
    }

    /// `rerunTask`.
    pub async fn rerun_task(&self, task_id: &str) -> EngineResult<TaskWithRuns> {
        let task = self.load_or_not_found(task_id).await?;
        let now = Utc::now();

        if now >= task.task.deadline {
            return Err(EngineError::RequestConflict(format!("task {task_id} is past its deadline")));
        }

        match task.last_run() {
            Some(last) if !last.state.parse::<RunState>().map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))?.is_terminal() => {
                return Err(EngineError::RequestConflict(format!(
                    "task {task_id}'s last run is not terminal"
                )));
            }
            None => {
                return Err(EngineError::RequestConflict(format!(
                    "task {task_id} has no runs to rerun"
                )));
            }
            _ => {}
        }

        if task.runs.len() as i32 >= self.config.max_runs_allowed {
            return Err(EngineError::RequestConflict(format!(
                "task {task_id} already has {} runs, at the {} limit",
                task.runs.len(),
                self.config.max_runs_allowed
            )));
        }

        let new_retries_left = task.task.retries.min(self.config.max_runs_allowed - task.runs.len() as i32 - 1);
        let run_id = task.runs.len() as i32;
        let run = NewRun::pending(run_id, &ReasonCreated::Rerun.to_string(), now);

        let updated = task_db::append_run(self.pool, task_id, &run, Some(new_retries_left))
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;

        self.emit_pending(&updated, run_id).await?;
        Ok(updated)
    }

    /// `cancelTask`.
    pub async fn cancel_task(&self, task_id: &str) -> EngineResult<TaskWithRuns> {
        let task = self.load_or_not_found(task_id).await?;
        if Utc::now() >= task.task.deadline {
            return Err(EngineError::RequestConflict(format!("task {task_id} is past its deadline")));
        }
        resolve_active_run_as_exception(self.pool, self.config, task_id, ReasonResolved::Canceled)
            .await?
            .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))
    }

    /// `reportCompleted`: only succeeds for the last run
    /// when it is `running`; verifies every `object`-storage-type
    /// artifact for the run is `present` before committing.
    pub async fn report_completed(&self, task_id: &str, run_id: i32) -> EngineResult<TaskWithRuns> {
        let task = self.require_running_run(task_id, run_id).await?;

        let all_present = taskforge_db::queries::artifacts::all_object_artifacts_present(self.pool, task_id, run_id)
            .await
            .map_err(EngineError::Internal)?;
        if !all_present {
            return Err(EngineError::RequestConflict(format!(
                "run {task_id}/{run_id} has object-storage artifacts that are not yet present"
            )));
        }

        let resolved = Utc::now();
        let updated = task_db::resolve_run(
            self.pool,
            task_id,
            run_id,
            &RunState::Completed.to_string(),
            &ReasonResolved::Completed.to_string(),
            resolved,
        )
        .await
        .map_err(EngineError::Internal)?
        .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;

        self.emit_resolution(&updated, run_id, RunState::Completed).await?;
        let _ = task;
        Ok(updated)
    }

    /// `reportFailed`.
    pub async fn report_failed(&self, task_id: &str, run_id: i32) -> EngineResult<TaskWithRuns> {
        self.require_running_run(task_id, run_id).await?;

        let resolved = Utc::now();
        let updated = task_db::resolve_run(
            self.pool,
            task_id,
            run_id,
            &RunState::Failed.to_string(),
            &ReasonResolved::Failed.to_string(),
            resolved,
        )
        .await
        .map_err(EngineError::Internal)?
        .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;

        self.emit_resolution(&updated, run_id, RunState::Failed).await?;
        Ok(updated)
    }

    /// `reportException`: for `worker-shutdown` and
    /// `intermittent-task` with `retriesLeft > 0`, retries instead of
    /// terminally resolving — decrements `retriesLeft`, appends a new
    /// pending run, and emits `task-pending` only, never `task-exception`.
    pub async fn report_exception(
        &self,
        task_id: &str,
        run_id: i32,
        reason: ReasonResolved,
    ) -> EngineResult<TaskWithRuns> {
        let task = self.require_running_run(task_id, run_id).await?;

        let resolved = Utc::now();
        let updated = task_db::resolve_run(
            self.pool,
            task_id,
            run_id,
            &RunState::Exception.to_string(),
            &reason.to_string(),
            resolved,
        )
        .await
        .map_err(EngineError::Internal)?
        .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;

        if reason.is_retryable_exception() && task.task.retries_left > 0 {
            let new_retries_left = task.task.retries_left - 1;
            let new_run_id = updated.runs.len() as i32;
            let reason_created = if task.runs.len() == 1 {
                ReasonCreated::Retry
            } else {
                ReasonCreated::TaskRetry
            };
            let new_run = NewRun::pending(new_run_id, &reason_created.to_string(), resolved);
            let retried = task_db::append_run(self.pool, task_id, &new_run, Some(new_retries_left))
                .await
                .map_err(EngineError::Internal)?
                .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;
            self.emit_pending(&retried, new_run_id).await?;
            Ok(retried)
        } else {
            self.emit_resolution(&updated, run_id, RunState::Exception).await?;
            Ok(updated)
        }
    }

    async fn require_running_run(&self, task_id: &str, run_id: i32) -> EngineResult<TaskWithRuns> {
        let task = self.load_or_not_found(task_id).await?;
        let run = task
            .runs
            .iter()
            .find(|r| r.run_id == run_id)
            .ok_or_else(|| EngineError::ResourceNotFound(format!("{task_id}/{run_id}")))?;
        let is_last = task.runs.last().map(|r| r.run_id) == Some(run_id);
        if !is_last || run.state != RunState::Running.to_string() {
            return Err(EngineError::RequestConflict(format!(
                "run {task_id}/{run_id} is not the last running run"
            )));
        }
        Ok(task)
    }

    async fn load_or_not_found(&self, task_id: &str) -> EngineResult<TaskWithRuns> {
        task_db::load_task(self.pool, task_id)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))
    }

    async fn publish_task_defined(&self, task: &TaskWithRuns) -> EngineResult<()> {
        let routes: Vec<String> = serde_json::from_value(task.task.routes.clone()).unwrap_or_default();
        let fields = RoutingFields {
            task_id: &task.task.task_id,
            run_id: None,
            worker_group: None,
            worker_id: None,
            provisioner_id: &task.task.provisioner_id,
            worker_type: &task.task.worker_type,
            scheduler_id: &task.task.scheduler_id,
            task_group_id: &task.task.task_group_id,
            routes: &routes,
        };
        let key = event_bus::build_routing_key(&fields);
        let cc = event_bus::route_cc_keys(&routes);
        event_bus::publish_pool(self.pool, Topic::TaskDefined, &key, &cc, task_status_json(task))
            .await
            .map_err(EngineError::Internal)
    }

    async fn emit_pending(&self, task: &TaskWithRuns, run_id: i32) -> EngineResult<()> {
        emit_pending_shared(self.pool, task, run_id).await
    }

    async fn emit_resolution(&self, task: &TaskWithRuns, run_id: i32, state: RunState) -> EngineResult<()> {
        emit_resolution_shared(self.pool, task, run_id, state).await
    }
}

/// Whether two task rows represent the "identical definition" required for
/// `createTask`'s idempotency collision handling.
fn definitions_match(existing: &TaskRow, attempted: &NewTaskRow) -> bool {
    existing.provisioner_id == attempted.provisioner_id
        && existing.worker_type == attempted.worker_type
        && existing.scheduler_id == attempted.scheduler_id
        && existing.task_group_id == attempted.task_group_id
        && existing.requires == attempted.requires
        && existing.priority == attempted.priority
        && existing.retries == attempted.retries
        && existing.created == attempted.created
        && existing.deadline == attempted.deadline
        && existing.expires == attempted.expires
        && existing.scopes == attempted.scopes
        && existing.routes == attempted.routes
        && existing.tags == attempted.tags
        && existing.payload == attempted.payload
        && existing.metadata_extra == attempted.metadata_extra
}

fn pending_queue_name(provisioner_id: &str, worker_type: &str, priority: &str) -> String {
    format!("pending/{provisioner_id}/{worker_type}/{priority}")
}

fn task_status_json(task: &TaskWithRuns) -> Json {
    json!({
        "taskId": task.task.task_id,
        "provisionerId": task.task.provisioner_id,
        "workerType": task.task.worker_type,
        "schedulerId": task.task.scheduler_id,
        "taskGroupId": task.task.task_group_id,
        "retriesLeft": task.task.retries_left,
        "runs": task.runs.iter().map(|r| json!({
            "runId": r.run_id,
            "state": r.state,
            "reasonCreated": r.reason_created,
            "reasonResolved": r.reason_resolved,
            "scheduled": r.scheduled,
            "started": r.started,
            "resolved": r.resolved,
            "workerGroup": r.worker_group,
            "workerId": r.worker_id,
        })).collect::<Vec<_>>(),
    })
}

/// Enqueue the pending advisory message for `run_id` and publish
/// `task-pending`. Shared by `TaskLifecycle::{create,rerun_task,report_exception}`
/// and `DependencyTracker::schedule_task`/the claim-expiration resolver's
/// retry path, since every one of those is "a run just became pending."
pub(crate) async fn emit_pending_shared(pool: &PgPool, task: &TaskWithRuns, run_id: i32) -> EngineResult<()> {
    let queue_name = pending_queue_name(&task.task.provisioner_id, &task.task.worker_type, &task.task.priority);
    queue::put(pool, &queue_name, &json!({ "taskId": task.task.task_id, "runId": run_id }), Utc::now())
        .await
        .map_err(EngineError::Internal)?;

    let routes: Vec<String> = serde_json::from_value(task.task.routes.clone()).unwrap_or_default();
    let fields = RoutingFields {
        task_id: &task.task.task_id,
        run_id: Some(run_id),
        worker_group: None,
        worker_id: None,
        provisioner_id: &task.task.provisioner_id,
        worker_type: &task.task.worker_type,
        scheduler_id: &task.task.scheduler_id,
        task_group_id: &task.task.task_group_id,
        routes: &routes,
    };
    let key = event_bus::build_routing_key(&fields);
    let cc = event_bus::route_cc_keys(&routes);
    event_bus::publish_pool(pool, Topic::TaskPending, &key, &cc, task_status_json(task))
        .await
        .map_err(EngineError::Internal)
}

/// Enqueue the resolved advisory message and publish the topic matching
/// `state` (`task-completed`/`task-failed`/`task-exception`). Shared by
/// every terminal-resolution call site.
pub(crate) async fn emit_resolution_shared(
    pool: &PgPool,
    task: &TaskWithRuns,
    run_id: i32,
    state: RunState,
) -> EngineResult<()> {
    let resolution = task
        .runs
        .iter()
        .find(|r| r.run_id == run_id)
        .and_then(|r| r.reason_resolved.clone())
        .unwrap_or_default();

    queue::put(
        pool,
        "resolved",
        &json!({
            "taskId": task.task.task_id,
            "taskGroupId": task.task.task_group_id,
            "schedulerId": task.task.scheduler_id,
            "resolution": resolution,
        }),
        Utc::now(),
    )
    .await
    .map_err(EngineError::Internal)?;

    let topic = match state {
        RunState::Completed => Topic::TaskCompleted,
        RunState::Failed => Topic::TaskFailed,
        RunState::Exception => Topic::TaskException,
        RunState::Pending | RunState::Running => {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "emit_resolution_shared called with non-terminal state {state}"
            )));
        }
    };

    let routes: Vec<String> = serde_json::from_value(task.task.routes.clone()).unwrap_or_default();
    let run = task.runs.iter().find(|r| r.run_id == run_id);
    let fields = RoutingFields {
        task_id: &task.task.task_id,
        run_id: Some(run_id),
        worker_group: run.and_then(|r| r.worker_group.as_deref()),
        worker_id: run.and_then(|r| r.worker_id.as_deref()),
        provisioner_id: &task.task.provisioner_id,
        worker_type: &task.task.worker_type,
        scheduler_id: &task.task.scheduler_id,
        task_group_id: &task.task.task_group_id,
        routes: &routes,
    };
    let key = event_bus::build_routing_key(&fields);
    let cc = event_bus::route_cc_keys(&routes);
    event_bus::publish_pool(pool, topic, &key, &cc, task_status_json(task))
        .await
        .map_err(EngineError::Internal)
}

/// Force the last run into `exception` with the given reason — or append a
/// synthetic exception run if the task has none — and emit the resolved
/// message + `task-exception` event, but only if this call actually
/// produced a fresh resolution (idempotent: a task whose last run is
/// already terminal is left untouched). Shared by `cancelTask`, the
/// dependency-doom path ("the dependent is cancelled"), and
/// the deadline resolver.
pub(crate) async fn resolve_active_run_as_exception(
    pool: &PgPool,
    _config: &EngineConfig,
    task_id: &str,
    reason: ReasonResolved,
) -> EngineResult<Option<TaskWithRuns>> {
    let Some(task) = task_db::load_task(pool, task_id).await.map_err(EngineError::Internal)? else {
        return Ok(None);
    };

    let now = Utc::now();

    match task.last_run() {
        Some(last) if !last
            .state
            .parse::<RunState>()
            .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))?
            .is_terminal() =>
        {
            let run_id = last.run_id;
            let updated = task_db::resolve_run(
                pool,
                task_id,
                run_id,
                &RunState::Exception.to_string(),
                &reason.to_string(),
                now,
            )
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;
            emit_resolution_shared(pool, &updated, run_id, RunState::Exception).await?;
            Ok(Some(updated))
        }
        None => {
            let run = NewRun {
                run_id: 0,
                state: RunState::Exception.to_string(),
                reason_created: ReasonCreated::Exception.to_string(),
                scheduled: Some(now),
            };
            let updated = task_db::append_run(pool, task_id, &run, None)
                .await
                .map_err(EngineError::Internal)?
                .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;
            // append_run doesn't set resolved/reason_resolved on the new
            // row; do that now in a second pass so it reads as a properly
            // terminal run rather than a still-open one.
            let resolved = task_db::resolve_run(
                pool,
                task_id,
                0,
                &RunState::Exception.to_string(),
                &reason.to_string(),
                now,
            )
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::ResourceNotFound(task_id.to_owned()))?;
            emit_resolution_shared(pool, &resolved, 0, RunState::Exception).await?;
            Ok(Some(resolved))
        }
        Some(_) => Ok(Some(task)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_queue_name_format() {
        assert_eq!(
            pending_queue_name("prov1", "worker-a", "highest"),
            "pending/prov1/worker-a/highest"
        );
    }

    #[test]
    fn definitions_match_requires_all_opaque_fields_equal() {
        let row = TaskRow {
            task_id: "T".into(),
            provisioner_id: "p".into(),
            worker_type: "w".into(),
            scheduler_id: "s".into(),
            task_group_id: "g".into(),
            requires: "all-completed".into(),
            priority: "lowest".into(),
            retries: 3,
            retries_left: 3,
            created: Utc::now(),
            deadline: Utc::now(),
            expires: Utc::now(),
            taken_until: Utc::now(),
            scopes: json!([]),
            routes: json!([]),
            tags: json!([]),
            payload: json!({"a": 1}),
            metadata_extra: json!({}),
            unresolved_deps: 0,
            version: 0,
        };
        let attempted = NewTaskRow {
            task_id: "T".into(),
            provisioner_id: "p".into(),
            worker_type: "w".into(),
            scheduler_id: "s".into(),
            task_group_id: "g".into(),
            requires: "all-completed".into(),
            priority: "lowest".into(),
            retries: 3,
            created: row.created,
            deadline: row.deadline,
            expires: row.expires,
            scopes: json!([]),
            routes: json!([]),
            tags: json!([]),
            payload: json!({"a": 1}),
            metadata_extra: json!({}),
            unresolved_deps: 0,
        };
        assert!(definitions_match(&row, &attempted));

        let mut different = attempted.clone();
        different.payload = json!({"a": 2});
        assert!(!definitions_match(&row, &different));
    }
}
