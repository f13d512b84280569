//! End-to-end resolver scenarios against a real Postgres instance: the
//! claim-expiration retry/exhaustion paths, the deadline resolver, and
//! restart-recovery for a running run with no claim-expiration message.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use taskforge_core::config::EngineConfig;
use taskforge_core::credential::CredentialConfig;
use taskforge_core::lifecycle::{TaskDefinition, TaskLifecycle};
use taskforge_core::resolvers::Resolvers;
use taskforge_core::work_claimer::WorkClaimer;
use taskforge_core::worker_registry::WorkerRegistry;
use taskforge_db::ids;
use taskforge_db::models::{Priority, RequiresMode};

fn def(task_group_id: &str, retries: i32, deadline_in: ChronoDuration) -> TaskDefinition {
    let now = Utc::now();
    TaskDefinition {
        provisioner_id: "prov1".into(),
        worker_type: "worker-a".into(),
        scheduler_id: "sched1".into(),
        task_group_id: task_group_id.to_owned(),
        scopes: vec![],
        routes: vec![],
        dependencies: vec![],
        requires: RequiresMode::AllCompleted,
        priority: Priority::Highest,
        retries,
        created: now,
        deadline: now + deadline_in,
        expires: None,
        payload: json!({ "cmd": "echo hi" }),
        metadata: json!({}),
        tags: json!([]),
    }
}

async fn setup() -> (PgPool, String) {
    taskforge_test_utils::create_test_db().await
}

/// Runs a resolver loop for `run_for` before cancelling it, so a test can
/// observe exactly one (or a few) drain cycles instead of looping forever.
async fn run_briefly<F, Fut>(run_for: Duration, loop_fn: F)
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = taskforge_core::error::EngineResult<()>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(loop_fn(cancel.clone()));
    tokio::time::sleep(run_for).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn claim_expiration_retries_when_retries_left() {
    let (pool, db_name) = setup().await;
    let mut config = EngineConfig::new();
    config.claim_timeout = Duration::from_millis(50);
    config.claim_resolver_poll = Duration::from_millis(20);
    config.resolver_visibility_timeout = Duration::from_secs(60);

    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle
        .create(&task_id, def(&group_id, 2, ChronoDuration::hours(1)))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let claimed = claimer
        .claim("prov1", "worker-a", "wg1", "w1", 1, &cancel)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // Let the claim's takenUntil (50ms out) pass so the claim-expiration
    // message becomes visible to the resolver.
    tokio::time::sleep(Duration::from_millis(80)).await;

    {
        let pool = pool.clone();
        let config = config.clone();
        run_briefly(Duration::from_millis(150), move |cancel| async move {
            Resolvers::new(&pool, &config).run_claim_expiration(&cancel).await
        })
        .await;
    }

    let after = taskforge_db::queries::tasks::load_task(&pool, &task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.runs.len(), 2, "an expired claim with retries left should append a retry run");
    assert_eq!(after.runs[0].state, "exception");
    assert_eq!(after.runs[0].reason_resolved.as_deref(), Some("claim-expired"));
    assert_eq!(after.runs[1].state, "pending");
    assert_eq!(after.runs[1].reason_created, "retry");
    assert_eq!(after.task.retries_left, 1);

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_expiration_terminates_when_retries_exhausted() {
    let (pool, db_name) = setup().await;
    let mut config = EngineConfig::new();
    config.claim_timeout = Duration::from_millis(50);
    config.claim_resolver_poll = Duration::from_millis(20);
    config.resolver_visibility_timeout = Duration::from_secs(60);

    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle
        .create(&task_id, def(&group_id, 0, ChronoDuration::hours(1)))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let claimed = claimer
        .claim("prov1", "worker-a", "wg1", "w1", 1, &cancel)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    {
        let pool = pool.clone();
        let config = config.clone();
        run_briefly(Duration::from_millis(150), move |cancel| async move {
            Resolvers::new(&pool, &config).run_claim_expiration(&cancel).await
        })
        .await;
    }

    let after = taskforge_db::queries::tasks::load_task(&pool, &task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.runs.len(), 1, "no retries left means the run stays terminal");
    assert_eq!(after.runs[0].state, "exception");
    assert_eq!(after.runs[0].reason_resolved.as_deref(), Some("claim-expired"));

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn deadline_resolver_exceptions_a_task_past_its_deadline() {
    let (pool, db_name) = setup().await;
    let mut config = EngineConfig::new();
    config.deadline_resolver_poll = Duration::from_millis(20);
    config.resolver_visibility_timeout = Duration::from_secs(60);

    let lifecycle = TaskLifecycle::new(&pool, &config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle
        .create(&task_id, def(&group_id, 2, ChronoDuration::milliseconds(50)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;

    {
        let pool = pool.clone();
        let config = config.clone();
        run_briefly(Duration::from_millis(150), move |cancel| async move {
            Resolvers::new(&pool, &config).run_deadline(&cancel).await
        })
        .await;
    }

    let after = taskforge_db::queries::tasks::load_task(&pool, &task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.runs.len(), 1, "deadline exceeded does not retry");
    assert_eq!(after.runs[0].state, "exception");
    assert_eq!(after.runs[0].reason_resolved.as_deref(), Some("deadline-exceeded"));

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recover_orphaned_claims_re_enqueues_missing_claim_expiration_messages() {
    let (pool, db_name) = setup().await;
    let mut config = EngineConfig::new();
    config.claim_timeout = Duration::from_millis(50);
    config.claim_resolver_poll = Duration::from_millis(20);
    config.resolver_visibility_timeout = Duration::from_secs(60);

    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle
        .create(&task_id, def(&group_id, 2, ChronoDuration::hours(1)))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let claimed = claimer
        .claim("prov1", "worker-a", "wg1", "w1", 1, &cancel)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // Simulate a crash that lost the claim-expiration message: delete it
    // directly (bypassing `queue::delete`, which needs the id's native type).
    sqlx::query("DELETE FROM advisory_queue_messages WHERE queue = 'claim-expiration'")
        .execute(&pool)
        .await
        .unwrap();

    let recovered = Resolvers::new(&pool, &config).recover_orphaned_claims().await.unwrap();
    assert_eq!(recovered, 1);

    let remaining: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM advisory_queue_messages WHERE queue = 'claim-expiration'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(remaining.0, 1, "a claim-expiration message should have been re-enqueued");

    // A second sweep finds nothing new to recover.
    let recovered_again = Resolvers::new(&pool, &config).recover_orphaned_claims().await.unwrap();
    assert_eq!(recovered_again, 0);

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn recover_unresolved_deadlines_re_enqueues_missing_deadline_messages() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle
        .create(&task_id, def(&group_id, 2, ChronoDuration::milliseconds(50)))
        .await
        .unwrap();

    // The normal creation path already enqueued a deadline message; delete
    // it to simulate it having been lost, then wait for the deadline itself
    // to pass.
    sqlx::query("DELETE FROM advisory_queue_messages WHERE queue = 'deadline'")
        .execute(&pool)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let recovered = Resolvers::new(&pool, &config).recover_unresolved_deadlines().await.unwrap();
    assert_eq!(recovered, 1);

    let remaining: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM advisory_queue_messages WHERE queue = 'deadline'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(remaining.0, 1, "a deadline message should have been re-enqueued");

    // A second sweep finds nothing new, since the message now exists.
    let recovered_again = Resolvers::new(&pool, &config).recover_unresolved_deadlines().await.unwrap();
    assert_eq!(recovered_again, 0);

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_returns_empty_for_a_quarantined_worker_without_draining_the_queue() {
    let (pool, db_name) = setup().await;
    let mut config = EngineConfig::new();
    config.claim_long_poll = Duration::from_millis(100);

    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);
    let registry = WorkerRegistry::new(&pool, &config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle
        .create(&task_id, def(&group_id, 0, ChronoDuration::hours(1)))
        .await
        .unwrap();

    registry
        .quarantine("prov1", "worker-a", "wg1", "w1", Utc::now() + ChronoDuration::hours(1))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let started = tokio::time::Instant::now();
    let claimed = claimer
        .claim("prov1", "worker-a", "wg1", "w1", 1, &cancel)
        .await
        .unwrap();
    assert!(claimed.is_empty(), "a quarantined worker must not be handed any work");
    assert!(
        started.elapsed() >= Duration::from_millis(90),
        "a quarantined claim should sleep out the long-poll window instead of returning immediately"
    );

    let seen = registry.get("prov1", "worker-a", "wg1", "w1").await.unwrap().unwrap();
    assert!(seen.last_seen <= Utc::now(), "a quarantined claim still records the worker as seen");

    // The task is still pending; a quarantined claim never touches the queue.
    let after = taskforge_db::queries::tasks::load_task(&pool, &task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.runs[0].state, "pending");

    taskforge_test_utils::drop_test_db(&db_name).await;
}
