//! Row types for every table the engine persists to, plus the small
//! hand-rolled enums that need a stable wire/SQL text representation.
//!
//! Enums are stored as `text` columns (CHECK-constrained in the migration)
//! rather than native Postgres enums so that adding a variant is a pure
//! application-side change. Each carries a `Display`/`FromStr` pair and a
//! dedicated parse-error type, following the pattern used throughout this
//! workspace for every wire-facing enum.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlx::FromRow;

/// A run's current lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Exception)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Exception => "exception",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid run state: {0}")]
pub struct RunStateParseError(String);

impl FromStr for RunState {
    type Err = RunStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "completed" => Ok(RunState::Completed),
            "failed" => Ok(RunState::Failed),
            "exception" => Ok(RunState::Exception),
            other => Err(RunStateParseError(other.to_owned())),
        }
    }
}

/// Why a run was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCreated {
    Scheduled,
    Retry,
    TaskRetry,
    Rerun,
    Exception,
}

impl fmt::Display for ReasonCreated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasonCreated::Scheduled => "scheduled",
            ReasonCreated::Retry => "retry",
            ReasonCreated::TaskRetry => "task-retry",
            ReasonCreated::Rerun => "rerun",
            ReasonCreated::Exception => "exception",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid reason-created: {0}")]
pub struct ReasonCreatedParseError(String);

impl FromStr for ReasonCreated {
    type Err = ReasonCreatedParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ReasonCreated::Scheduled),
            "retry" => Ok(ReasonCreated::Retry),
            "task-retry" => Ok(ReasonCreated::TaskRetry),
            "rerun" => Ok(ReasonCreated::Rerun),
            "exception" => Ok(ReasonCreated::Exception),
            other => Err(ReasonCreatedParseError(other.to_owned())),
        }
    }
}

/// Why a run was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonResolved {
    Completed,
    Failed,
    DeadlineExceeded,
    Canceled,
    Superseded,
    ClaimExpired,
    WorkerShutdown,
    MalformedPayload,
    ResourceUnavailable,
    InternalError,
    IntermittentTask,
}

impl ReasonResolved {
    /// `reportException` reasons that are retried if `retriesLeft > 0`
    /// rather than terminally resolved.
    pub fn is_retryable_exception(self) -> bool {
        matches!(self, ReasonResolved::WorkerShutdown | ReasonResolved::IntermittentTask)
    }
}

impl fmt::Display for ReasonResolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReasonResolved::Completed => "completed",
            ReasonResolved::Failed => "failed",
            ReasonResolved::DeadlineExceeded => "deadline-exceeded",
            ReasonResolved::Canceled => "canceled",
            ReasonResolved::Superseded => "superseded",
            ReasonResolved::ClaimExpired => "claim-expired",
            ReasonResolved::WorkerShutdown => "worker-shutdown",
            ReasonResolved::MalformedPayload => "malformed-payload",
            ReasonResolved::ResourceUnavailable => "resource-unavailable",
            ReasonResolved::InternalError => "internal-error",
            ReasonResolved::IntermittentTask => "intermittent-task",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid reason-resolved: {0}")]
pub struct ReasonResolvedParseError(String);

impl FromStr for ReasonResolved {
    type Err = ReasonResolvedParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(ReasonResolved::Completed),
            "failed" => Ok(ReasonResolved::Failed),
            "deadline-exceeded" => Ok(ReasonResolved::DeadlineExceeded),
            "canceled" => Ok(ReasonResolved::Canceled),
            "superseded" => Ok(ReasonResolved::Superseded),
            "claim-expired" => Ok(ReasonResolved::ClaimExpired),
            "worker-shutdown" => Ok(ReasonResolved::WorkerShutdown),
            "malformed-payload" => Ok(ReasonResolved::MalformedPayload),
            "resource-unavailable" => Ok(ReasonResolved::ResourceUnavailable),
            "internal-error" => Ok(ReasonResolved::InternalError),
            "intermittent-task" => Ok(ReasonResolved::IntermittentTask),
            other => Err(ReasonResolvedParseError(other.to_owned())),
        }
    }
}

/// Seven-tier dispatch priority. `normal` is not a variant: callers rewrite
/// it to `Lowest` before it ever reaches the Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Highest,
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
    Lowest,
}

impl Priority {
    /// All levels, highest first — the order `WorkClaimer::claim` must
    /// drain pending queues in.
    pub const ALL: [Priority; 7] = [
        Priority::Highest,
        Priority::VeryHigh,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::VeryLow,
        Priority::Lowest,
    ];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Highest => "highest",
            Priority::VeryHigh => "very-high",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::VeryLow => "very-low",
            Priority::Lowest => "lowest",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid priority: {0}")]
pub struct PriorityParseError(String);

impl FromStr for Priority {
    type Err = PriorityParseError;

    /// Accepts the bare seven levels plus the `normal` alias, which this
    /// parser itself rewrites to `Lowest`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "highest" => Ok(Priority::Highest),
            "very-high" => Ok(Priority::VeryHigh),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "very-low" => Ok(Priority::VeryLow),
            "lowest" | "normal" => Ok(Priority::Lowest),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Dependency-satisfaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequiresMode {
    AllCompleted,
    AllResolved,
}

impl fmt::Display for RequiresMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequiresMode::AllCompleted => "all-completed",
            RequiresMode::AllResolved => "all-resolved",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid requires mode: {0}")]
pub struct RequiresModeParseError(String);

impl FromStr for RequiresMode {
    type Err = RequiresModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all-completed" => Ok(RequiresMode::AllCompleted),
            "all-resolved" => Ok(RequiresMode::AllResolved),
            other => Err(RequiresModeParseError(other.to_owned())),
        }
    }
}

/// Row from the `tasks` table: immutable definition plus the mutable
/// `retries_left`/`taken_until`/`version` fields.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub task_id: String,
    pub provisioner_id: String,
    pub worker_type: String,
    pub scheduler_id: String,
    pub task_group_id: String,
    pub requires: String,
    pub priority: String,
    pub retries: i32,
    pub retries_left: i32,
    pub created: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub taken_until: DateTime<Utc>,
    pub scopes: Json,
    pub routes: Json,
    pub tags: Json,
    pub payload: Json,
    pub metadata_extra: Json,
    pub unresolved_deps: i32,
    pub version: i64,
}

/// Row from the `runs` table.
#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub task_id: String,
    pub run_id: i32,
    pub state: String,
    pub reason_created: String,
    pub reason_resolved: Option<String>,
    pub scheduled: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub resolved: Option<DateTime<Utc>>,
    pub run_taken_until: Option<DateTime<Utc>>,
    pub worker_group: Option<String>,
    pub worker_id: Option<String>,
}

/// A task plus its full, ordered run sequence — the unit `TaskLifecycle`
/// and `DependencyTracker` actually operate on.
#[derive(Debug, Clone)]
pub struct TaskWithRuns {
    pub task: TaskRow,
    pub runs: Vec<RunRow>,
}

impl TaskWithRuns {
    /// Derived task state: `unscheduled` with no runs, otherwise the
    /// state of the last run.
    pub fn last_run(&self) -> Option<&RunRow> {
        self.runs.last()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskGroupRow {
    pub task_group_id: String,
    pub scheduler_id: String,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskDependencyRow {
    pub dependent_task_id: String,
    pub required_task_id: String,
    pub requires: String,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ArtifactRow {
    pub task_id: String,
    pub run_id: i32,
    pub name: String,
    pub storage_type: String,
    pub expires: DateTime<Utc>,
    pub present: bool,
}

/// Row from `advisory_queue_messages`.
#[derive(Debug, Clone, FromRow)]
pub struct QueueMessageRow {
    pub id: uuid::Uuid,
    pub queue: String,
    pub payload: Json,
    pub visible_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Row from `event_outbox`.
#[derive(Debug, Clone, FromRow)]
pub struct EventOutboxRow {
    pub id: uuid::Uuid,
    pub topic: String,
    pub routing_key: String,
    pub payload: Json,
    pub published_at: Option<DateTime<Utc>>,
}

/// Row from `workers` (`WorkerRegistry`).
#[derive(Debug, Clone, FromRow)]
pub struct WorkerRow {
    pub provisioner_id: String,
    pub worker_type: String,
    pub worker_group: String,
    pub worker_id: String,
    pub last_seen: DateTime<Utc>,
    pub quarantine_until: Option<DateTime<Utc>>,
    pub recent_task_ids: Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_roundtrip() {
        for s in [
            RunState::Pending,
            RunState::Running,
            RunState::Completed,
            RunState::Failed,
            RunState::Exception,
        ] {
            assert_eq!(s.to_string().parse::<RunState>().unwrap(), s);
        }
    }

    #[test]
    fn run_state_terminal() {
        assert!(!RunState::Pending.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Exception.is_terminal());
    }

    #[test]
    fn priority_roundtrip_and_order() {
        for p in Priority::ALL {
            assert_eq!(p.to_string().parse::<Priority>().unwrap(), p);
        }
        assert!(Priority::Highest < Priority::Lowest);
    }

    #[test]
    fn priority_normal_alias_rewrites_to_lowest() {
        assert_eq!("normal".parse::<Priority>().unwrap(), Priority::Lowest);
    }

    #[test]
    fn reason_resolved_retryable_exceptions() {
        assert!(ReasonResolved::WorkerShutdown.is_retryable_exception());
        assert!(ReasonResolved::IntermittentTask.is_retryable_exception());
        assert!(!ReasonResolved::ClaimExpired.is_retryable_exception());
        assert!(!ReasonResolved::Completed.is_retryable_exception());
    }

    #[test]
    fn requires_mode_roundtrip() {
        for m in [RequiresMode::AllCompleted, RequiresMode::AllResolved] {
            assert_eq!(m.to_string().parse::<RequiresMode>().unwrap(), m);
        }
    }

    #[test]
    fn invalid_run_state_is_rejected() {
        assert!("bogus".parse::<RunState>().is_err());
    }
}
