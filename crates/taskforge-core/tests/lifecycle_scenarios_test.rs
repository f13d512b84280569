//! End-to-end lifecycle scenarios against a real Postgres instance, covering
//! the concrete walkthroughs this engine needs to get right: zero-dependency
//! scheduling, claim/complete, dependency chains, cancellation, and retry.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use taskforge_core::config::EngineConfig;
use taskforge_core::credential::CredentialConfig;
use taskforge_core::dependency::DependencyTracker;
use taskforge_core::error::EngineError;
use taskforge_core::lifecycle::{TaskDefinition, TaskLifecycle};
use taskforge_core::work_claimer::WorkClaimer;
use taskforge_db::ids;
use taskforge_db::models::{Priority, ReasonResolved, RequiresMode};

fn def(task_group_id: &str) -> TaskDefinition {
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
        retries: 2,
        created: now,
        deadline: now + ChronoDuration::hours(1),
        expires: None,
        payload: json!({ "cmd": "echo hi" }),
        metadata: json!({}),
        tags: json!([]),
    }
}

async fn setup() -> (PgPool, String) {
    taskforge_test_utils::create_test_db().await
}

#[tokio::test]
async fn create_task_with_zero_dependencies_starts_pending() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    let created = lifecycle.create(&task_id, def(&group_id)).await.unwrap();

    assert_eq!(created.runs.len(), 1);
    assert_eq!(created.runs[0].state, "pending");

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_task_idempotent_same_definition_returns_existing() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    let definition = def(&group_id);

    let first = lifecycle.create(&task_id, definition.clone()).await.unwrap();
    let second = lifecycle.create(&task_id, definition).await.unwrap();

    assert_eq!(first.task.task_id, second.task.task_id);
    assert_eq!(first.runs.len(), second.runs.len());

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn create_task_conflicting_redefinition_is_rejected() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle.create(&task_id, def(&group_id)).await.unwrap();

    let mut different = def(&group_id);
    different.payload = json!({ "cmd": "echo bye" });
    let result = lifecycle.create(&task_id, different).await;

    assert!(matches!(result, Err(EngineError::RequestConflict(_))));

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_then_report_completed_flow() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle.create(&task_id, def(&group_id)).await.unwrap();

    let cancel = CancellationToken::new();
    let claimed = claimer
        .claim("prov1", "worker-a", "wg1", "w1", 1, &cancel)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].task.task.task_id, task_id);
    assert!(claimed[0].credential.starts_with("taskforge_rc_"));

    let completed = lifecycle.report_completed(&task_id, claimed[0].run_id).await.unwrap();
    assert_eq!(completed.runs[0].state, "completed");

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dependency_chain_schedules_dependent_on_completion() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);
    let tracker = DependencyTracker::new(&pool, &config);

    let group_id = ids::generate_task_id();
    let upstream_id = ids::generate_task_id();
    lifecycle.create(&upstream_id, def(&group_id)).await.unwrap();

    let downstream_id = ids::generate_task_id();
    let mut downstream_def = def(&group_id);
    downstream_def.dependencies = vec![upstream_id.clone()];
    let downstream = lifecycle.create(&downstream_id, downstream_def).await.unwrap();
    assert!(downstream.runs.is_empty(), "dependent starts unscheduled");

    let cancel = CancellationToken::new();
    let claimed = claimer
        .claim("prov1", "worker-a", "wg1", "w1", 1, &cancel)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].task.task.task_id, upstream_id);

    let resolved_upstream = lifecycle.report_completed(&upstream_id, claimed[0].run_id).await.unwrap();
    tracker.resolve_dependencies_of(&resolved_upstream).await.unwrap();

    let downstream_after = taskforge_db::queries::tasks::load_task(&pool, &downstream_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(downstream_after.runs.len(), 1);
    assert_eq!(downstream_after.runs[0].state, "pending");

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dependency_failure_under_all_completed_dooms_dependent() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);
    let tracker = DependencyTracker::new(&pool, &config);

    let group_id = ids::generate_task_id();
    let upstream_id = ids::generate_task_id();
    lifecycle.create(&upstream_id, def(&group_id)).await.unwrap();

    let downstream_id = ids::generate_task_id();
    let mut downstream_def = def(&group_id);
    downstream_def.dependencies = vec![upstream_id.clone()];
    downstream_def.requires = RequiresMode::AllCompleted;
    lifecycle.create(&downstream_id, downstream_def).await.unwrap();

    let cancel = CancellationToken::new();
    let claimed = claimer.claim("prov1", "worker-a", "wg1", "w1", 1, &cancel).await.unwrap();
    let resolved_upstream = lifecycle.report_failed(&upstream_id, claimed[0].run_id).await.unwrap();
    tracker.resolve_dependencies_of(&resolved_upstream).await.unwrap();

    let downstream_after = taskforge_db::queries::tasks::load_task(&pool, &downstream_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(downstream_after.runs.len(), 1);
    assert_eq!(downstream_after.runs[0].state, "exception");
    assert_eq!(downstream_after.runs[0].reason_resolved.as_deref(), Some(ReasonResolved::Superseded.to_string().as_str()));

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cancel_task_resolves_to_exception() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle.create(&task_id, def(&group_id)).await.unwrap();

    let cancelled = lifecycle.cancel_task(&task_id).await.unwrap();
    assert_eq!(cancelled.runs[0].state, "exception");
    assert_eq!(cancelled.runs[0].reason_resolved.as_deref(), Some("canceled"));

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn rerun_after_failure_appends_new_run() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle.create(&task_id, def(&group_id)).await.unwrap();

    let cancel = CancellationToken::new();
    let claimed = claimer.claim("prov1", "worker-a", "wg1", "w1", 1, &cancel).await.unwrap();
    lifecycle.report_failed(&task_id, claimed[0].run_id).await.unwrap();

    let rerun = lifecycle.rerun_task(&task_id).await.unwrap();
    assert_eq!(rerun.runs.len(), 2);
    assert_eq!(rerun.runs[1].state, "pending");
    assert_eq!(rerun.runs[1].reason_created, "rerun");

    taskforge_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn reclaim_requires_strictly_advancing_taken_until() {
    let (pool, db_name) = setup().await;
    let config = EngineConfig::new();
    let lifecycle = TaskLifecycle::new(&pool, &config);
    let credential_config = CredentialConfig::new(b"test-secret".to_vec());
    let claimer = WorkClaimer::new(&pool, &config, &credential_config);

    let task_id = ids::generate_task_id();
    let group_id = ids::generate_task_id();
    lifecycle.create(&task_id, def(&group_id)).await.unwrap();

    let cancel = CancellationToken::new();
    let claimed = claimer.claim("prov1", "worker-a", "wg1", "w1", 1, &cancel).await.unwrap();
    let run_id = claimed[0].run_id;

    let stale = Utc::now();
    let result = claimer.reclaim(&task_id, run_id, "wg1", "w1", stale).await;
    assert!(matches!(result, Err(EngineError::RequestConflict(_))));

    let extended = Utc::now() + ChronoDuration::hours(1);
    let reclaimed = claimer.reclaim(&task_id, run_id, "wg1", "w1", extended).await.unwrap();
    assert_eq!(reclaimed.runs[0].state, "running");

    taskforge_test_utils::drop_test_db(&db_name).await;
}
