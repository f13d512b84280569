//! `taskforge resolvers run`: runs the three background resolver loops
//! (claim-expiration, deadline, resolved) plus the event-outbox publisher
//! concurrently until SIGINT/SIGTERM, then lets in-flight batches drain
//! before exiting.
//!
//! Watches both `tokio::signal::ctrl_c()` and SIGTERM since this runs as a
//! long-lived daemon rather than an interactive server, and wires both into
//! a `tokio_util::sync::CancellationToken` for cooperative shutdown.

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use taskforge_core::config::EngineConfig;
use taskforge_core::resolvers::Resolvers;

pub async fn run_resolvers(pool: PgPool, config: EngineConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    tracing::info!("starting resolver loops (claim-expiration, deadline, resolved, event-publisher)");

    let recovered = Resolvers::new(&pool, &config).recover_orphaned_claims().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "re-enqueued claim-expiration messages for orphaned running runs");
    }
    let recovered_deadlines = Resolvers::new(&pool, &config).recover_unresolved_deadlines().await?;
    if recovered_deadlines > 0 {
        tracing::warn!(recovered_deadlines, "re-enqueued deadline messages for tasks missing one");
    }

    let pool_a = pool.clone();
    let pool_b = pool.clone();
    let pool_c = pool.clone();
    let pool_d = pool;
    let config_a = config.clone();
    let config_b = config.clone();
    let config_c = config.clone();
    let config_d = config;
    let cancel_a = cancel.clone();
    let cancel_b = cancel.clone();
    let cancel_c = cancel.clone();
    let cancel_d = cancel.clone();

    let handle_a = tokio::spawn(async move {
        Resolvers::new(&pool_a, &config_a).run_claim_expiration(&cancel_a).await
    });
    let handle_b = tokio::spawn(async move {
        Resolvers::new(&pool_b, &config_b).run_deadline(&cancel_b).await
    });
    let handle_c = tokio::spawn(async move {
        Resolvers::new(&pool_c, &config_c).run_resolved(&cancel_c).await
    });
    let handle_d = tokio::spawn(async move {
        Resolvers::new(&pool_d, &config_d).run_event_publisher_default(&cancel_d).await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining in-flight resolver batches");
    cancel.cancel();

    handle_a.await??;
    handle_b.await??;
    handle_c.await??;
    handle_d.await??;

    tracing::info!("resolver loops stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
