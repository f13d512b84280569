//! `claimWork`/`reclaimTask`: the worker-facing half of the operation
//! surface. Every `claim` call also records the worker as seen, per
//! `WorkerRegistry`'s liveness-tracking contract.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use taskforge_core::config::EngineConfig;
use taskforge_core::credential::CredentialConfig;
use taskforge_core::work_claimer::WorkClaimer;
use taskforge_core::worker_registry::WorkerRegistry;

#[allow(clippy::too_many_arguments)]
pub async fn run_claim(
    pool: &PgPool,
    config: &EngineConfig,
    credential_config: &CredentialConfig,
    provisioner_id: &str,
    worker_type: &str,
    worker_group: &str,
    worker_id: &str,
    count: i64,
) -> Result<()> {
    let claimer = WorkClaimer::new(pool, config, credential_config);
    let cancel = CancellationToken::new();
    let claimed = claimer
        .claim(provisioner_id, worker_type, worker_group, worker_id, count, &cancel)
        .await?;

    let registry = WorkerRegistry::new(pool, config);
    registry.record_seen(provisioner_id, worker_type, worker_group, worker_id).await?;
    for run in &claimed {
        registry.push_recent_task(provisioner_id, worker_type, worker_group, worker_id, &run.task.task.task_id).await?;
    }

    if claimed.is_empty() {
        println!("no work available");
        return Ok(());
    }
    for run in &claimed {
        println!(
            "claimed {}/{} credential={}",
            run.task.task.task_id, run.run_id, run.credential
        );
    }
    Ok(())
}

pub async fn run_reclaim(
    pool: &PgPool,
    config: &EngineConfig,
    credential_config: &CredentialConfig,
    task_id: &str,
    run_id: i32,
    worker_group: &str,
    worker_id: &str,
    extend_secs: i64,
) -> Result<()> {
    let claimer = WorkClaimer::new(pool, config, credential_config);
    let new_taken_until = Utc::now() + chrono::Duration::seconds(extend_secs);
    let task = claimer
        .reclaim(task_id, run_id, worker_group, worker_id, new_taken_until)
        .await
        .with_context(|| format!("reclaim of {task_id}/{run_id} failed"))?;

    println!("reclaimed {}/{} until {}", task.task.task_id, run_id, new_taken_until);
    Ok(())
}
