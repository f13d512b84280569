//! Operator commands against `WorkerRegistry`: inspect liveness and place a
//! worker into quarantine.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;

use taskforge_core::config::EngineConfig;
use taskforge_core::worker_registry::WorkerRegistry;

pub async fn run_show(
    pool: &PgPool,
    config: &EngineConfig,
    provisioner_id: &str,
    worker_type: &str,
    worker_group: &str,
    worker_id: &str,
) -> Result<()> {
    let registry = WorkerRegistry::new(pool, config);
    let worker = registry
        .get(provisioner_id, worker_type, worker_group, worker_id)
        .await?
        .with_context(|| format!("worker {worker_group}/{worker_id} has never been seen"))?;

    println!("Worker: {}/{}", worker.worker_group, worker.worker_id);
    println!("  provisionerId={} workerType={}", worker.provisioner_id, worker.worker_type);
    println!("  lastSeen={}", worker.last_seen.format("%Y-%m-%d %H:%M:%S UTC"));
    match worker.quarantine_until {
        Some(until) if until > Utc::now() => {
            println!("  quarantined until {}", until.format("%Y-%m-%d %H:%M:%S UTC"))
        }
        _ => println!("  not quarantined"),
    }
    println!("  recentTasks={}", worker.recent_task_ids);
    Ok(())
}

pub async fn run_quarantine(
    pool: &PgPool,
    config: &EngineConfig,
    provisioner_id: &str,
    worker_type: &str,
    worker_group: &str,
    worker_id: &str,
    duration_secs: i64,
) -> Result<()> {
    let registry = WorkerRegistry::new(pool, config);
    let until = Utc::now() + ChronoDuration::seconds(duration_secs);
    registry
        .quarantine(provisioner_id, worker_type, worker_group, worker_id, until)
        .await?;
    println!("worker {worker_group}/{worker_id} quarantined until {until}");
    Ok(())
}
