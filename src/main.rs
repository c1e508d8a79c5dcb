//! # TaskClaw — Cron-Style Task Scheduler Daemon
//!
//! Schedules shell commands on cron, interval, or one-shot triggers, gates
//! them on the outcome of upstream tasks, and records every run in SQLite.
//!
//! Usage:
//!   taskclaw                              # Run with ~/.taskclaw/config.toml
//!   taskclaw --tasks tasks.toml           # Register task definitions first
//!   taskclaw --db /tmp/taskclaw.db -v     # Custom database, debug logging

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use taskclaw_core::config::TaskClawConfig;
use taskclaw_scheduler::{Schedule, ScheduleKind, SchedulerDb, SchedulerEngine, Task, spawn_scheduler};

#[derive(Parser)]
#[command(
    name = "taskclaw",
    version,
    about = "⏰ TaskClaw — cron-style task scheduler with dependency gating"
)]
struct Cli {
    /// Config file (default: ~/.taskclaw/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Task definitions to register at startup (TOML)
    #[arg(short, long)]
    tasks: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// On-disk task definition format:
///
/// ```toml
/// [[task]]
/// name = "backup"
/// command = "tar czf /backups/home.tgz /home"
/// schedule = "cron"
/// value = "0 3 * * *"
/// dependencies = ["healthcheck"]
/// ```
#[derive(Deserialize)]
struct TaskFile {
    #[serde(default)]
    task: Vec<TaskDef>,
}

#[derive(Deserialize)]
struct TaskDef {
    name: String,
    command: String,
    /// "cron" | "interval" | "once"
    schedule: String,
    /// Cron expression, interval like "5m", or RFC 3339 timestamp.
    value: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    priority: Option<u8>,
    /// Names of upstream tasks from the same file.
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Register tasks from a TOML file. Names double as stable ids so
/// re-running with the same file updates in place instead of duplicating.
fn register_tasks(engine: &SchedulerEngine, path: &PathBuf, config: &TaskClawConfig) -> Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read task file {}", path.display()))?;
    let file: TaskFile =
        toml::from_str(&text).with_context(|| format!("Invalid task file {}", path.display()))?;

    let mut registered = 0;
    for def in file.task {
        let kind = ScheduleKind::parse(&def.schedule)?;
        let schedule = Schedule::parse(kind, &def.value)
            .with_context(|| format!("Task '{}' has an invalid schedule", def.name))?;

        let mut task = Task::new(&def.name, &def.command, schedule);
        task.id = def.name.clone();
        task.description = def.description;
        task.timezone = def.timezone.unwrap_or_else(|| "UTC".to_string());
        task.timeout_secs = def.timeout_secs.unwrap_or(config.execution.default_timeout_secs);
        task.max_retries = def.max_retries.unwrap_or(config.execution.max_retries);
        task.priority = def.priority.unwrap_or(5);
        task.dependencies = def.dependencies;
        task.enabled = def.enabled;

        engine
            .add_task(task)
            .with_context(|| format!("Cannot register task '{}'", def.name))?;
        registered += 1;
    }
    Ok(registered)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "taskclaw=debug,taskclaw_scheduler=debug"
    } else {
        "taskclaw=info,taskclaw_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    // Load config
    let config = match &cli.config {
        Some(path) => TaskClawConfig::load_from(path)
            .with_context(|| format!("Cannot load config {}", path.display()))?,
        None => TaskClawConfig::load().unwrap_or_default(),
    };

    // Resolve and open the database
    let db_path = match &cli.db {
        Some(path) => path.clone(),
        None => config.database.resolve_path(),
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = SchedulerDb::open(&db_path)
        .with_context(|| format!("Cannot open database {}", db_path.display()))?;

    let engine = SchedulerEngine::new(
        Arc::new(db),
        config.scheduler.clone(),
        config.execution.clone(),
    );

    // Register task definitions before the first tick
    if let Some(tasks_path) = &cli.tasks {
        let count = register_tasks(&engine, tasks_path, &config)?;
        tracing::info!("📋 Registered {count} task(s) from {}", tasks_path.display());
    }

    let task_count = engine.store().all_tasks()?.len();
    println!("⏰ TaskClaw v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database:  {}", db_path.display());
    println!("   📋 Tasks:     {task_count}");
    println!(
        "   ⚙️  Tick: {}s, workers: {}, wait horizon: {}s",
        config.scheduler.tick_interval_secs,
        config.scheduler.max_workers,
        config.scheduler.wait_horizon_secs
    );
    println!();

    // Run until ctrl-c, then drain in-flight executions
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loop_handle = tokio::spawn(spawn_scheduler(Arc::clone(&engine), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested");
    shutdown_tx.send(true).ok();
    loop_handle.await?;

    Ok(())
}
