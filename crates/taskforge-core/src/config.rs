//! `EngineConfig`: every authoritative timing and limit constant behind a
//! struct instead of bare `const`s, following `taskforge_db::config::DbConfig`'s
//! `from_env()`/`new()`/`Default` shape — so resolver poll intervals and the
//! claim long-poll duration are overridable in tests without touching the
//! constants module itself.

use std::env;
use std::time::Duration;

/// Configuration for the dispatch engine's timing constants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum runs a single task may accumulate.
    pub max_runs_allowed: i32,
    /// Maximum allowed skew between a task's `created` field and wall
    /// clock at creation time.
    pub created_skew: Duration,
    /// Maximum `deadline - created` horizon (the "5 days" component; the
    /// 15-minute drift allowance is added on top by callers).
    pub max_deadline_horizon: Duration,
    /// Extra drift allowance layered onto the deadline horizon and the
    /// created-skew check.
    pub drift_allowance: Duration,
    /// Default `expires = deadline + this` when `expires` is omitted.
    pub default_expires_offset: Duration,
    /// How much a task group's `expires` is extended by on task creation.
    pub task_group_expires_extension: Duration,
    /// `WorkClaimer::claim`'s long-poll ceiling.
    pub claim_long_poll: Duration,
    /// `AdvisoryQueue::count`'s allowed staleness.
    pub pending_count_cache_ttl: Duration,
    /// Visibility timeout granted to a claimed pending message while the
    /// Store transition that turns it into a `running` run commits.
    pub claim_timeout: Duration,
    /// Claim-expiration resolver: batch size and poll interval.
    pub claim_resolver_batch: i64,
    pub claim_resolver_poll: Duration,
    /// Deadline resolver: batch size and poll interval.
    pub deadline_resolver_batch: i64,
    pub deadline_resolver_poll: Duration,
    /// Resolved resolver: batch size and poll interval.
    pub resolved_resolver_batch: i64,
    pub resolved_resolver_poll: Duration,
    /// Visibility timeout granted to messages received by a resolver loop.
    pub resolver_visibility_timeout: Duration,
    /// Bound on the `WorkerRegistry` recent-task ring per worker.
    pub worker_recent_tasks_cap: usize,
    /// Event-outbox publisher: batch size and poll interval.
    pub event_publish_batch: i64,
    pub event_publish_poll: Duration,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            max_runs_allowed: 50,
            created_skew: Duration::from_secs(15 * 60),
            max_deadline_horizon: Duration::from_secs(5 * 24 * 60 * 60),
            drift_allowance: Duration::from_secs(15 * 60),
            default_expires_offset: Duration::from_secs(365 * 24 * 60 * 60),
            task_group_expires_extension: Duration::from_secs(24 * 60 * 60),
            claim_long_poll: Duration::from_secs(20),
            pending_count_cache_ttl: Duration::from_secs(20),
            claim_timeout: Duration::from_secs(20 * 60),
            claim_resolver_batch: 20,
            claim_resolver_poll: Duration::from_secs(5),
            deadline_resolver_batch: 20,
            deadline_resolver_poll: Duration::from_secs(5),
            resolved_resolver_batch: 20,
            resolved_resolver_poll: Duration::from_secs(5),
            resolver_visibility_timeout: Duration::from_secs(2 * 60),
            worker_recent_tasks_cap: 50,
            event_publish_batch: 50,
            event_publish_poll: Duration::from_secs(2),
        }
    }

    /// Override resolver poll intervals and the claim long-poll duration
    /// from the environment, for operators who need to tune a running
    /// deployment without a code change. Falls back to [`Self::new`]'s
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::new();
        if let Some(v) = env_secs("TASKFORGE_CLAIM_LONG_POLL_SECS") {
            cfg.claim_long_poll = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("TASKFORGE_CLAIM_TIMEOUT_SECS") {
            cfg.claim_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("TASKFORGE_CLAIM_RESOLVER_POLL_SECS") {
            cfg.claim_resolver_poll = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("TASKFORGE_DEADLINE_RESOLVER_POLL_SECS") {
            cfg.deadline_resolver_poll = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("TASKFORGE_RESOLVED_RESOLVER_POLL_SECS") {
            cfg.resolved_resolver_poll = Duration::from_secs(v);
        }
        if let Some(v) = env_secs("TASKFORGE_EVENT_PUBLISH_POLL_SECS") {
            cfg.event_publish_poll = Duration::from_secs(v);
        }
        cfg
    }
}

fn env_secs(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = EngineConfig::new();
        assert_eq!(cfg.max_runs_allowed, 50);
        assert_eq!(cfg.claim_long_poll, Duration::from_secs(20));
        assert_eq!(cfg.pending_count_cache_ttl, Duration::from_secs(20));
        assert_eq!(cfg.max_deadline_horizon, Duration::from_secs(5 * 24 * 60 * 60));
        assert_eq!(cfg.created_skew, Duration::from_secs(15 * 60));
    }

    #[test]
    fn env_override_claim_long_poll() {
        // SAFETY: test-only; env var manipulation is safe in single-threaded tests.
        unsafe { env::set_var("TASKFORGE_CLAIM_LONG_POLL_SECS", "5") };
        let cfg = EngineConfig::from_env();
        assert_eq!(cfg.claim_long_poll, Duration::from_secs(5));
        unsafe { env::remove_var("TASKFORGE_CLAIM_LONG_POLL_SECS") };
    }
}
