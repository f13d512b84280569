//! Task lifecycle commands: create, define, schedule, rerun, cancel, the
//! three `report*` terminal calls, and the read-only status/listing views.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;

use taskforge_core::config::EngineConfig;
use taskforge_core::lifecycle::{TaskDefinition, TaskLifecycle};
use taskforge_db::models::{Priority, ReasonResolved, RequiresMode, TaskRow, TaskWithRuns};
use taskforge_db::queries::tasks as task_db;

/// Shared fields for `create`/`define`, parsed straight off the CLI.
pub struct DefineArgs {
    pub provisioner_id: String,
    pub worker_type: String,
    pub scheduler_id: String,
    pub task_group_id: String,
    pub scopes: Vec<String>,
    pub routes: Vec<String>,
    pub dependencies: Vec<String>,
    pub requires: RequiresMode,
    pub priority: Priority,
    pub retries: i32,
    pub deadline_secs: i64,
    pub expires_secs: Option<i64>,
    pub payload: String,
    pub metadata: String,
    pub tags: String,
}

fn build_definition(args: DefineArgs) -> Result<TaskDefinition> {
    let now = Utc::now();
    let payload = serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;
    let metadata = serde_json::from_str(&args.metadata).context("--metadata is not valid JSON")?;
    let tags = serde_json::from_str(&args.tags).context("--tags is not valid JSON")?;
    let expires = args
        .expires_secs
        .map(|secs| now + ChronoDuration::seconds(secs));

    Ok(TaskDefinition {
        provisioner_id: args.provisioner_id,
        worker_type: args.worker_type,
        scheduler_id: args.scheduler_id,
        task_group_id: args.task_group_id,
        scopes: args.scopes,
        routes: args.routes,
        dependencies: args.dependencies,
        requires: args.requires,
        priority: args.priority,
        retries: args.retries,
        created: now,
        deadline: now + ChronoDuration::seconds(args.deadline_secs),
        expires,
        payload,
        metadata,
        tags,
    })
}

pub async fn run_create(pool: &PgPool, config: &EngineConfig, task_id: &str, args: DefineArgs) -> Result<()> {
    let lifecycle = TaskLifecycle::new(pool, config);
    let def = build_definition(args)?;
    let task = lifecycle.create(task_id, def).await?;
    print_task(&task);
    Ok(())
}

pub async fn run_define(pool: &PgPool, config: &EngineConfig, task_id: &str, args: DefineArgs) -> Result<()> {
    let lifecycle = TaskLifecycle::new(pool, config);
    let def = build_definition(args)?;
    let task = lifecycle.define_task(task_id, def).await?;
    print_task(&task);
    Ok(())
}

pub async fn run_schedule(pool: &PgPool, config: &EngineConfig, task_id: &str) -> Result<()> {
    let lifecycle = TaskLifecycle::new(pool, config);
    let task = lifecycle.schedule_task(task_id).await?;
    print_task(&task);
    Ok(())
}

pub async fn run_rerun(pool: &PgPool, config: &EngineConfig, task_id: &str) -> Result<()> {
    let lifecycle = TaskLifecycle::new(pool, config);
    let task = lifecycle.rerun_task(task_id).await?;
    print_task(&task);
    Ok(())
}

pub async fn run_cancel(pool: &PgPool, config: &EngineConfig, task_id: &str) -> Result<()> {
    let lifecycle = TaskLifecycle::new(pool, config);
    let task = lifecycle.cancel_task(task_id).await?;
    print_task(&task);
    Ok(())
}

pub async fn run_report_completed(pool: &PgPool, config: &EngineConfig, task_id: &str, run_id: i32) -> Result<()> {
    let lifecycle = TaskLifecycle::new(pool, config);
    let task = lifecycle.report_completed(task_id, run_id).await?;
    print_task(&task);
    Ok(())
}

pub async fn run_report_failed(pool: &PgPool, config: &EngineConfig, task_id: &str, run_id: i32) -> Result<()> {
    let lifecycle = TaskLifecycle::new(pool, config);
    let task = lifecycle.report_failed(task_id, run_id).await?;
    print_task(&task);
    Ok(())
}

pub async fn run_report_exception(
    pool: &PgPool,
    config: &EngineConfig,
    task_id: &str,
    run_id: i32,
    reason: ReasonResolved,
) -> Result<()> {
    let lifecycle = TaskLifecycle::new(pool, config);
    let task = lifecycle.report_exception(task_id, run_id, reason).await?;
    print_task(&task);
    Ok(())
}

pub async fn run_get(pool: &PgPool, task_id: &str) -> Result<()> {
    let task = task_db::load_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;
    print_task(&task);
    Ok(())
}

pub async fn run_list_group(pool: &PgPool, task_group_id: &str) -> Result<()> {
    let tasks = task_db::list_by_group(pool, task_group_id).await?;
    print_task_table(&tasks);
    Ok(())
}

pub async fn run_list_dependents(pool: &PgPool, required_task_id: &str) -> Result<()> {
    let tasks = task_db::list_dependents(pool, required_task_id).await?;
    print_task_table(&tasks);
    Ok(())
}

pub async fn run_pending(
    pool: &PgPool,
    provisioner_id: &str,
    worker_type: &str,
    after: Option<&str>,
    limit: i64,
) -> Result<()> {
    let tasks = task_db::scan_pending(pool, provisioner_id, worker_type, after, limit).await?;
    print_task_table(&tasks);
    Ok(())
}

fn derived_state(task: &TaskWithRuns) -> String {
    task.last_run().map(|r| r.state.clone()).unwrap_or_else(|| "unscheduled".to_string())
}

fn print_task(task: &TaskWithRuns) {
    println!("Task: {} ({})", task.task.task_id, derived_state(task));
    println!(
        "  provisionerId={} workerType={} schedulerId={} taskGroupId={}",
        task.task.provisioner_id, task.task.worker_type, task.task.scheduler_id, task.task.task_group_id,
    );
    println!(
        "  priority={} retriesLeft={}/{} deadline={} unresolvedDeps={}",
        task.task.priority,
        task.task.retries_left,
        task.task.retries,
        fmt_time(task.task.deadline),
        task.task.unresolved_deps,
    );
    if task.runs.is_empty() {
        println!("  runs: none");
        return;
    }
    println!("  runs:");
    for run in &task.runs {
        let resolved = run.reason_resolved.as_deref().unwrap_or("-");
        println!(
            "    #{} {} created={} resolved={}",
            run.run_id, run.state, run.reason_created, resolved,
        );
    }
}

fn print_task_table(tasks: &[TaskRow]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }
    println!("{:<24} {:<16} {:<12} {:<10}", "TASK", "GROUP", "PRIORITY", "RETRIES");
    println!("{}", "-".repeat(66));
    for task in tasks {
        println!(
            "{:<24} {:<16} {:<12} {:<10}",
            task.task_id, task.task_group_id, task.priority, task.retries_left,
        );
    }
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
