//! Operation-surface error kinds.
//!
//! These are the four kinds every `TaskLifecycle`/`WorkClaimer` operation
//! can return to a caller. Internal plumbing (Store/queue/bus calls) stays
//! in `anyhow::Result` up to the boundary, where it collapses into
//! `EngineError::Internal`.

use thiserror::Error;

/// Errors returned across the engine's operation surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The task/run definition failed validation: scopes ending `**`, bad
    /// timestamp ordering, oversize properties, an unknown dependency.
    /// Non-retryable.
    #[error("input error: {0}")]
    InputError(String),

    /// `taskId`/`runId`/`provisionerId` unknown.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Idempotency collision with a different definition, conflicting
    /// `schedulerId` within a task group, an operation against
    /// terminal/resolved state, a past-deadline operation, a run not in
    /// the expected state, or a `reclaim` that does not advance
    /// `takenUntil`.
    #[error("request conflict: {0}")]
    RequestConflict(String),

    /// Scope check failed. The core only forwards this from the
    /// out-of-scope auth collaborator; it never evaluates scopes itself.
    #[error("authorization error: {0}")]
    AuthorizationError(String),

    /// A Store/queue/bus call failed permanently after the retry policy
    /// gave up.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
