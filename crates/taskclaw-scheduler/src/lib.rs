//! # TaskClaw Scheduler
//!
//! Cron-style task scheduling with dependency gating and supervised
//! subprocess execution. Built for long-lived daemons on small machines.
//!
//! ## Design Principles
//! - No external queue (no Redis, no RabbitMQ)
//! - SQLite persistence — survives restarts
//! - Tokio timers only — zero overhead when idle
//! - One scheduler loop, bounded worker pool, at most one run per task
//! - Dependency gate — worst-case-wins over the latest run of each dependency
//!
//! ## Architecture
//! ```text
//! Scheduler loop (tokio interval)
//!   ├── due scan: enabled tasks with next_run_at <= now, priority order
//!   ├── still running? → drop occurrence, advance next_run_at
//!   ├── DependencyGate → Run | Wait | Skip | Fail
//!   └── Run → worker pool (semaphore) → ExecutionRunner
//!               ├── sh -c <command>, own process group
//!               ├── capped stdout/stderr capture
//!               ├── timeout → SIGKILL process group
//!               └── retry up to max_retries, then terminal status
//!
//! Every outcome → ExecutionStore (SQLite) + EventRouter (per-subscriber mpsc fan-out)
//! ```

pub mod cron;
pub mod engine;
pub mod gate;
pub mod notify;
pub mod persistence;
pub mod runner;
pub mod store;
pub mod tasks;

pub use engine::{SchedulerEngine, TickStats, spawn_scheduler};
pub use gate::{DepState, GateDecision};
pub use notify::{EventKind, EventRouter, TaskEvent};
pub use persistence::SchedulerDb;
pub use runner::{ExecutionRunner, RunOutcome, RunnerConfig};
pub use store::{ExecutionStore, ExecutionUpdate, MemoryStore, Store, TaskStore};
pub use tasks::{Execution, ExecutionStatus, Schedule, ScheduleKind, Task};
