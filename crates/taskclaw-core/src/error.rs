//! TaskClaw error taxonomy.
//!
//! Schedule validation errors are the only ones meant to reach a user at task
//! definition time; everything else is recorded on the execution record and
//! logged, never allowed to take down the scheduler loop.

use thiserror::Error;

/// All errors produced by the TaskClaw crates.
#[derive(Debug, Error)]
pub enum TaskClawError {
    /// Malformed cron/interval/timestamp — surfaced at task creation or edit.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A declared dependency id does not exist in the system.
    #[error("Dependency not found: {0}")]
    DependencyNotFound(String),

    /// The dependency graph contains a cycle (rejected at definition time).
    #[error("Dependency cycle detected: {0}")]
    DependencyCycle(String),

    /// A task waited on its dependencies past the configured horizon.
    #[error("Starved waiting on dependencies: {0}")]
    Starvation(String),

    /// Storage layer failure (SQLite or in-memory store).
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration load/parse failure.
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias used across the workspace.
pub type Result<T> = std::result::Result<T, TaskClawError>;
