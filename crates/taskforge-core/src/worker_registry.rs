//! `WorkerRegistry`: liveness tracking, quarantine, and a
//! bounded recent-task ring per worker — consulted by operators for
//! status introspection and updated on every successful `claim`.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use taskforge_db::ids;
use taskforge_db::models::WorkerRow;
use taskforge_db::queries::workers;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};

pub struct WorkerRegistry<'a> {
    pool: &'a PgPool,
    config: &'a EngineConfig,
}

impl<'a> WorkerRegistry<'a> {
    pub fn new(pool: &'a PgPool, config: &'a EngineConfig) -> Self {
        Self { pool, config }
    }

    /// Record that a worker was just seen (every `claim` call touches
    /// this, whether or not it returned work).
    pub async fn record_seen(
        &self,
        provisioner_id: &str,
        worker_type: &str,
        worker_group: &str,
        worker_id: &str,
    ) -> EngineResult<()> {
        workers::record_seen(self.pool, provisioner_id, worker_type, worker_group, worker_id, Utc::now())
            .await
            .map_err(EngineError::Internal)
    }

    pub async fn get(
        &self,
        provisioner_id: &str,
        worker_type: &str,
        worker_group: &str,
        worker_id: &str,
    ) -> EngineResult<Option<WorkerRow>> {
        workers::load(self.pool, provisioner_id, worker_type, worker_group, worker_id)
            .await
            .map_err(EngineError::Internal)
    }

    /// Quarantine a worker until `until` — an operator action taken in
    /// response to a misbehaving worker; the core never
    /// quarantines a worker on its own initiative.
    pub async fn quarantine(
        &self,
        provisioner_id: &str,
        worker_type: &str,
        worker_group: &str,
        worker_id: &str,
        until: DateTime<Utc>,
    ) -> EngineResult<()> {
        if !ids::is_valid_generic_id(worker_group) || !ids::is_valid_generic_id(worker_id) {
            return Err(EngineError::InputError("malformed workerGroup/workerId".to_owned()));
        }
        workers::quarantine_until(self.pool, provisioner_id, worker_type, worker_group, worker_id, until)
            .await
            .map_err(EngineError::Internal)
    }

    /// Whether a worker is currently quarantined.
    pub async fn is_quarantined(
        &self,
        provisioner_id: &str,
        worker_type: &str,
        worker_group: &str,
        worker_id: &str,
    ) -> EngineResult<bool> {
        let row = self.get(provisioner_id, worker_type, worker_group, worker_id).await?;
        Ok(row.and_then(|w| w.quarantine_until).is_some_and(|until| until > Utc::now()))
    }

    /// Push a claimed task onto the worker's recent-task ring, bounded to
    /// `EngineConfig::worker_recent_tasks_cap`.
    pub async fn push_recent_task(
        &self,
        provisioner_id: &str,
        worker_type: &str,
        worker_group: &str,
        worker_id: &str,
        task_id: &str,
    ) -> EngineResult<()> {
        workers::push_recent_task(
            self.pool,
            provisioner_id,
            worker_type,
            worker_group,
            worker_id,
            task_id,
            self.config.worker_recent_tasks_cap,
        )
        .await
        .map_err(EngineError::Internal)
    }
}
