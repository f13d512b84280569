mod claim_cmds;
mod config;
mod resolvers_cmd;
mod task_cmds;
mod worker_cmds;

#[cfg(test)]
mod test_util;

use clap::{Parser, Subcommand};

use taskforge_core::config::EngineConfig;
use taskforge_db::models::{Priority, ReasonResolved, RequiresMode};
use taskforge_db::pool;

use config::TaskforgeConfig;
use task_cmds::DefineArgs;

#[derive(Parser)]
#[command(name = "taskforge", about = "Durable task queue and dispatch engine")]
struct Cli {
    /// Database URL (overrides TASKFORGE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a taskforge config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/taskforge")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the taskforge database (requires config file or env vars)
    DbInit,
    /// Create a task (schedules run 0 immediately if it has no dependencies)
    CreateTask {
        task_id: String,
        #[command(flatten)]
        def: DefineArgsCli,
    },
    /// Define a task (always starts unscheduled, via a self-dependency)
    DefineTask {
        task_id: String,
        #[command(flatten)]
        def: DefineArgsCli,
    },
    /// Force-schedule a task regardless of dependency state
    ScheduleTask { task_id: String },
    /// Append a new pending run to a task whose last run is terminal
    RerunTask { task_id: String },
    /// Cancel a task's active run
    CancelTask { task_id: String },
    /// Mark a run completed (requires all object-storage artifacts present)
    ReportCompleted { task_id: String, run_id: i32 },
    /// Mark a run failed
    ReportFailed { task_id: String, run_id: i32 },
    /// Report an exception on a run (may retry instead of terminally resolving)
    ReportException {
        task_id: String,
        run_id: i32,
        /// One of: deadline-exceeded, canceled, superseded, claim-expired,
        /// worker-shutdown, malformed-payload, resource-unavailable,
        /// internal-error, intermittent-task
        reason: ReasonResolved,
    },
    /// Show a task's current status
    GetTask { task_id: String },
    /// List every task sharing a task group
    ListTaskGroup { task_group_id: String },
    /// List the tasks that directly depend on a task
    ListDependentTasks { task_id: String },
    /// Page through tasks whose last run is pending
    PendingTasks {
        provisioner_id: String,
        worker_type: String,
        /// Last-seen taskId from a prior page
        #[arg(long)]
        after: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Long-poll up to `count` pending runs for a worker
    ClaimWork {
        provisioner_id: String,
        worker_type: String,
        worker_group: String,
        worker_id: String,
        #[arg(default_value_t = 1)]
        count: i64,
    },
    /// Extend a claimed run's takenUntil
    ReclaimTask {
        task_id: String,
        run_id: i32,
        worker_group: String,
        worker_id: String,
        /// Seconds from now the new takenUntil should be set to
        #[arg(long, default_value_t = 1200)]
        extend_secs: i64,
    },
    /// Show a worker's liveness/quarantine state
    GetWorker {
        provisioner_id: String,
        worker_type: String,
        worker_group: String,
        worker_id: String,
    },
    /// Quarantine a worker for a duration
    QuarantineWorker {
        provisioner_id: String,
        worker_type: String,
        worker_group: String,
        worker_id: String,
        #[arg(long, default_value_t = 3600)]
        duration_secs: i64,
    },
    /// Run the background resolver loops (claim-expiration, deadline,
    /// resolved) plus the event-outbox publisher
    Resolvers,
}

#[derive(clap::Args)]
struct DefineArgsCli {
    #[arg(long)]
    provisioner_id: String,
    #[arg(long)]
    worker_type: String,
    #[arg(long)]
    scheduler_id: String,
    #[arg(long)]
    task_group_id: String,
    #[arg(long = "scope")]
    scopes: Vec<String>,
    #[arg(long = "route")]
    routes: Vec<String>,
    #[arg(long = "depends-on")]
    dependencies: Vec<String>,
    #[arg(long, default_value = "all-completed")]
    requires: RequiresMode,
    #[arg(long, default_value = "normal")]
    priority: Priority,
    #[arg(long, default_value_t = 5)]
    retries: i32,
    /// Deadline, in seconds from now
    #[arg(long, default_value_t = 3600)]
    deadline_secs: i64,
    /// Expires, in seconds from now (defaults to deadline + 1 year)
    #[arg(long)]
    expires_secs: Option<i64>,
    #[arg(long, default_value = "{}")]
    payload: String,
    #[arg(long, default_value = "{}")]
    metadata: String,
    #[arg(long, default_value = "[]")]
    tags: String,
}

impl From<DefineArgsCli> for DefineArgs {
    fn from(cli: DefineArgsCli) -> Self {
        DefineArgs {
            provisioner_id: cli.provisioner_id,
            worker_type: cli.worker_type,
            scheduler_id: cli.scheduler_id,
            task_group_id: cli.task_group_id,
            scopes: cli.scopes,
            routes: cli.routes,
            dependencies: cli.dependencies,
            requires: cli.requires,
            priority: cli.priority,
            retries: cli.retries,
            deadline_secs: cli.deadline_secs,
            expires_secs: cli.expires_secs,
            payload: cli.payload,
            metadata: cli.metadata,
            tags: cli.tags,
        }
    }
}

/// Execute the `taskforge init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let secret = config::generate_credential_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        credential: config::CredentialSection {
            secret: secret.clone(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  credential.secret = {}...{}", &secret[..8], &secret[56..]);
    println!();
    println!("Next: run `taskforge db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `taskforge db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = TaskforgeConfig::resolve(cli_db_url)?;

    println!("Initializing taskforge database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("taskforge db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { db_url, force } = &cli.command {
        cmd_init(db_url, *force)?;
        return Ok(());
    }
    if let Commands::DbInit = &cli.command {
        cmd_db_init(cli.database_url.as_deref()).await?;
        return Ok(());
    }

    let resolved = TaskforgeConfig::resolve(cli.database_url.as_deref())?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let engine_config = EngineConfig::from_env();

    let result = run_command(cli.command, &db_pool, &engine_config, &resolved).await;
    db_pool.close().await;
    result
}

async fn run_command(
    command: Commands,
    db_pool: &sqlx::PgPool,
    engine_config: &EngineConfig,
    resolved: &TaskforgeConfig,
) -> anyhow::Result<()> {
    match command {
        Commands::Init { .. } | Commands::DbInit => unreachable!("handled before pool creation"),
        Commands::CreateTask { task_id, def } => {
            task_cmds::run_create(db_pool, engine_config, &task_id, def.into()).await?;
        }
        Commands::DefineTask { task_id, def } => {
            task_cmds::run_define(db_pool, engine_config, &task_id, def.into()).await?;
        }
        Commands::ScheduleTask { task_id } => {
            task_cmds::run_schedule(db_pool, engine_config, &task_id).await?;
        }
        Commands::RerunTask { task_id } => {
            task_cmds::run_rerun(db_pool, engine_config, &task_id).await?;
        }
        Commands::CancelTask { task_id } => {
            task_cmds::run_cancel(db_pool, engine_config, &task_id).await?;
        }
        Commands::ReportCompleted { task_id, run_id } => {
            task_cmds::run_report_completed(db_pool, engine_config, &task_id, run_id).await?;
        }
        Commands::ReportFailed { task_id, run_id } => {
            task_cmds::run_report_failed(db_pool, engine_config, &task_id, run_id).await?;
        }
        Commands::ReportException { task_id, run_id, reason } => {
            task_cmds::run_report_exception(db_pool, engine_config, &task_id, run_id, reason).await?;
        }
        Commands::GetTask { task_id } => {
            task_cmds::run_get(db_pool, &task_id).await?;
        }
        Commands::ListTaskGroup { task_group_id } => {
            task_cmds::run_list_group(db_pool, &task_group_id).await?;
        }
        Commands::ListDependentTasks { task_id } => {
            task_cmds::run_list_dependents(db_pool, &task_id).await?;
        }
        Commands::PendingTasks { provisioner_id, worker_type, after, limit } => {
            task_cmds::run_pending(db_pool, &provisioner_id, &worker_type, after.as_deref(), limit).await?;
        }
        Commands::ClaimWork { provisioner_id, worker_type, worker_group, worker_id, count } => {
            claim_cmds::run_claim(
                db_pool,
                engine_config,
                &resolved.credential_config,
                &provisioner_id,
                &worker_type,
                &worker_group,
                &worker_id,
                count,
            )
            .await?;
        }
        Commands::ReclaimTask { task_id, run_id, worker_group, worker_id, extend_secs } => {
            claim_cmds::run_reclaim(
                db_pool,
                engine_config,
                &resolved.credential_config,
                &task_id,
                run_id,
                &worker_group,
                &worker_id,
                extend_secs,
            )
            .await?;
        }
        Commands::GetWorker { provisioner_id, worker_type, worker_group, worker_id } => {
            worker_cmds::run_show(db_pool, engine_config, &provisioner_id, &worker_type, &worker_group, &worker_id)
                .await?;
        }
        Commands::QuarantineWorker { provisioner_id, worker_type, worker_group, worker_id, duration_secs } => {
            worker_cmds::run_quarantine(
                db_pool,
                engine_config,
                &provisioner_id,
                &worker_type,
                &worker_group,
                &worker_id,
                duration_secs,
            )
            .await?;
        }
        Commands::Resolvers => {
            resolvers_cmd::run_resolvers(db_pool.clone(), engine_config.clone()).await?;
        }
    }
    Ok(())
}
