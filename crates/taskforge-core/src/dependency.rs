//! `DependencyTracker` wires a task's declared dependencies
//! into `task_dependencies` edges and an `unresolvedDeps` counter, and fans
//! a resolved task's reverse edges out to its dependents.
//!
//! Rather than walking a dependent's full requirement set off an in-memory
//! graph on every resolution, the "count what's still outstanding, act when
//! it hits zero" logic is driven off the `unresolved_deps` column so it
//! survives a process restart mid-fan-out.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use taskforge_db::models::{ReasonResolved, RequiresMode, RunState, TaskWithRuns};
use taskforge_db::queries::tasks as task_db;
use taskforge_db::queries::dependencies as dep_db;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{emit_pending_shared, resolve_active_run_as_exception};

pub struct DependencyTracker<'a> {
    pool: &'a PgPool,
    config: &'a EngineConfig,
}

impl<'a> DependencyTracker<'a> {
    pub fn new(pool: &'a PgPool, config: &'a EngineConfig) -> Self {
        Self { pool, config }
    }

    /// `trackDependencies`: record the forward edges for a newly-created
    /// unscheduled task and set its `unresolvedDeps` counter. Every named
    /// dependency must already exist (`InputError` otherwise, the "unknown
    /// dependency" input-validation case).
    pub async fn track_dependencies(
        &self,
        task: &TaskWithRuns,
        dependency_ids: &[String],
        requires: RequiresMode,
        expires: DateTime<Utc>,
    ) -> EngineResult<()> {
        for dep_id in dependency_ids {
            let exists = task_db::load_task(self.pool, dep_id)
                .await
                .map_err(EngineError::Internal)?
                .is_some();
            if !exists && dep_id != &task.task.task_id {
                return Err(EngineError::InputError(format!(
                    "unknown dependency {dep_id} for task {}",
                    task.task.task_id
                )));
            }
            dep_db::insert_edge(self.pool, &task.task.task_id, dep_id, &requires.to_string(), expires)
                .await
                .map_err(EngineError::Internal)?;
        }

        task_db::set_unresolved_deps(self.pool, &task.task.task_id, dependency_ids.len() as i32)
            .await
            .map_err(EngineError::Internal)?;

        // A dependency may already be resolved by the time the edge is
        // written (e.g. `defineTask`'s self-dependency is resolved
        // explicitly by a later `resolveDependenciesOf` call, but a normal
        // dependency named here could already be terminal from an earlier
        // task). Re-check each one so a task never sits unscheduled behind
        // an already-satisfied dependency.
        for dep_id in dependency_ids {
            if let Some(dep) = task_db::load_task(self.pool, dep_id).await.map_err(EngineError::Internal)? {
                if dependency_is_satisfied(&dep, requires) {
                    // Consume the edge before resolving it: a concurrent
                    // `resolveDependenciesOf` fanning out from this same
                    // dependency races this shortcut for the same edge, and
                    // only one of them may decrement `unresolvedDeps`.
                    let taken = dep_db::delete_edge(self.pool, &task.task.task_id, dep_id)
                        .await
                        .map_err(EngineError::Internal)?;
                    if taken {
                        self.resolve_one_dependency(&task.task.task_id, &dep).await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// `scheduleTask`: force a task into `pending` now,
    /// regardless of outstanding dependencies. Idempotent — a task that has
    /// already been scheduled (has runs) is returned unchanged. Returns
    /// `Ok(None)` if the task is already past its deadline (caller maps
    /// this to `RequestConflict`).
    pub async fn schedule_task(&self, task_id: &str) -> EngineResult<Option<TaskWithRuns>> {
        let Some(task) = task_db::load_task(self.pool, task_id).await.map_err(EngineError::Internal)? else {
            return Err(EngineError::ResourceNotFound(task_id.to_owned()));
        };

        if !task.runs.is_empty() {
            return Ok(Some(task));
        }

        if Utc::now() >= task.task.deadline {
            return Ok(None);
        }

        self.append_pending_run_zero(&task).await.map(Some)
    }

    /// `resolveDependenciesOf`: called once a task reaches a
    /// terminal resolution. Decrements `unresolvedDeps` on every direct
    /// dependent; a dependent whose counter reaches zero is scheduled (if
    /// its `requires` condition is met) or doomed (if the resolution makes
    /// satisfying `requires` impossible — e.g. this task `failed` under
    /// `all-completed`).
    ///
    /// `take_reverse_edges` deletes the edges it returns in the same
    /// statement, so a redelivered `resolved` advisory message finds none
    /// left and fans out over nothing — the at-least-once delivery
    /// tolerance spec.md §3 requires of every handler here.
    pub async fn resolve_dependencies_of(&self, required: &TaskWithRuns) -> EngineResult<()> {
        let reverse = dep_db::take_reverse_edges(self.pool, &required.task.task_id)
            .await
            .map_err(EngineError::Internal)?;

        for edge in reverse {
            let requires: RequiresMode = edge
                .requires
                .parse()
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("{e}")))?;
            if !dependency_is_satisfied(required, requires) {
                // `all-completed` and this dependency did not complete: the
                // dependent can never satisfy its requirement. Doom it
                // instead of decrementing.
                self.doom_dependent(&edge.dependent_task_id).await?;
                continue;
            }
            self.resolve_one_dependency(&edge.dependent_task_id, required).await?;
        }

        Ok(())
    }

    async fn resolve_one_dependency(&self, dependent_task_id: &str, _required: &TaskWithRuns) -> EngineResult<()> {
        let Some(remaining) = task_db::decrement_unresolved_deps(self.pool, dependent_task_id)
            .await
            .map_err(EngineError::Internal)?
        else {
            return Ok(());
        };

        if remaining > 0 {
            return Ok(());
        }

        let Some(task) = task_db::load_task(self.pool, dependent_task_id)
            .await
            .map_err(EngineError::Internal)?
        else {
            return Ok(());
        };

        if !task.runs.is_empty() {
            // Already scheduled by a concurrent `scheduleTask` call.
            return Ok(());
        }

        if Utc::now() >= task.task.deadline {
            // Past deadline before its dependencies resolved: the deadline
            // resolver will pick this up and doom it; nothing to do here.
            return Ok(());
        }

        self.append_pending_run_zero(&task).await?;
        Ok(())
    }

    /// Doom an unscheduled dependent whose requirement can never be met.
    /// Appends a synthetic `exception` run rather than leaving the task
    /// permanently `unscheduled`.
    async fn doom_dependent(&self, dependent_task_id: &str) -> EngineResult<()> {
        resolve_active_run_as_exception(self.pool, self.config, dependent_task_id, ReasonResolved::Superseded)
            .await?;
        Ok(())
    }

    async fn append_pending_run_zero(&self, task: &TaskWithRuns) -> EngineResult<TaskWithRuns> {
        let now = Utc::now();
        let run = task_db::NewRun::pending(0, &taskforge_db::models::ReasonCreated::Scheduled.to_string(), now);
        let updated = task_db::append_run(self.pool, &task.task.task_id, &run, None)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::ResourceNotFound(task.task.task_id.clone()))?;
        emit_pending_shared(self.pool, &updated, 0).await?;
        Ok(updated)
    }
}

/// Whether `dep`'s current resolution satisfies `requires`:
/// `all-completed` requires the last run to be `completed`; `all-resolved`
/// accepts any terminal state.
fn dependency_is_satisfied(dep: &TaskWithRuns, requires: RequiresMode) -> bool {
    let Some(last) = dep.last_run() else {
        return false;
    };
    let Ok(state) = last.state.parse::<RunState>() else {
        return false;
    };
    match requires {
        RequiresMode::AllCompleted => state == RunState::Completed,
        RequiresMode::AllResolved => state.is_terminal(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskforge_db::models::{RunRow, TaskRow};

    fn task_with_state(state: &str) -> TaskWithRuns {
        let now = Utc::now();
        TaskWithRuns {
            task: TaskRow {
                task_id: "T".into(),
                provisioner_id: "p".into(),
                worker_type: "w".into(),
                scheduler_id: "s".into(),
                task_group_id: "g".into(),
                requires: "all-completed".into(),
                priority: "lowest".into(),
                retries: 0,
                retries_left: 0,
                created: now,
                deadline: now,
                expires: now,
                taken_until: now,
                scopes: json!([]),
                routes: json!([]),
                tags: json!([]),
                payload: json!({}),
                metadata_extra: json!({}),
                unresolved_deps: 0,
                version: 0,
            },
            runs: vec![RunRow {
                task_id: "T".into(),
                run_id: 0,
                state: state.into(),
                reason_created: "scheduled".into(),
                reason_resolved: None,
                scheduled: Some(now),
                started: Some(now),
                resolved: Some(now),
                run_taken_until: None,
                worker_group: None,
                worker_id: None,
            }],
        }
    }

    #[test]
    fn all_completed_requires_completed_state() {
        let completed = task_with_state("completed");
        let failed = task_with_state("failed");
        assert!(dependency_is_satisfied(&completed, RequiresMode::AllCompleted));
        assert!(!dependency_is_satisfied(&failed, RequiresMode::AllCompleted));
    }

    #[test]
    fn all_resolved_accepts_any_terminal_state() {
        let failed = task_with_state("failed");
        let exception = task_with_state("exception");
        assert!(dependency_is_satisfied(&failed, RequiresMode::AllResolved));
        assert!(dependency_is_satisfied(&exception, RequiresMode::AllResolved));
    }

    #[test]
    fn unresolved_dependency_never_satisfies() {
        let pending = task_with_state("pending");
        assert!(!dependency_is_satisfied(&pending, RequiresMode::AllResolved));
    }
}
