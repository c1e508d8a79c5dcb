//! TaskClaw configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TaskClawError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClawConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for TaskClawConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            execution: ExecutionConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Maximum concurrent task executions (worker pool size).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// How long a task may sit in WAIT on its dependencies before it is
    /// failed as starved, in seconds.
    #[serde(default = "default_wait_horizon")]
    pub wait_horizon_secs: u64,
    /// Grace period for in-flight executions on shutdown, in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Execution history retention in days; older terminal records are
    /// pruned. 0 keeps history forever.
    #[serde(default = "default_retention_days")]
    pub history_retention_days: u32,
}

fn default_tick_interval() -> u64 { 2 }
fn default_max_workers() -> usize { 10 }
fn default_wait_horizon() -> u64 { 3600 }
fn default_shutdown_grace() -> u64 { 10 }
fn default_retention_days() -> u32 { 90 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            max_workers: default_max_workers(),
            wait_horizon_secs: default_wait_horizon(),
            shutdown_grace_secs: default_shutdown_grace(),
            history_retention_days: default_retention_days(),
        }
    }
}

/// Subprocess execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Default timeout for tasks that do not set one, in seconds.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Default retry bound for tasks that do not set one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retry attempts, in seconds (0 = retry immediately).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Captured stdout/stderr cap per stream, in bytes. Excess is discarded.
    #[serde(default = "default_output_cap")]
    pub output_cap_bytes: usize,
}

fn default_timeout() -> u64 { 300 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> u64 { 0 }
fn default_output_cap() -> usize { 100 * 1024 }

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            output_cap_bytes: default_output_cap(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path. Empty = `~/.taskclaw/taskclaw.db`.
    #[serde(default)]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: String::new() }
    }
}

impl DatabaseConfig {
    /// Resolve the database path, falling back to the default location.
    pub fn resolve_path(&self) -> PathBuf {
        if self.path.is_empty() {
            TaskClawConfig::default_dir().join("taskclaw.db")
        } else {
            PathBuf::from(&self.path)
        }
    }
}

impl TaskClawConfig {
    /// Load config from the default path (~/.taskclaw/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskClawError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskClawError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskClawError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::default_dir().join("config.toml")
    }

    /// Get the default TaskClaw directory (~/.taskclaw).
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskclaw")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TaskClawConfig::default();
        assert_eq!(cfg.scheduler.tick_interval_secs, 2);
        assert_eq!(cfg.scheduler.max_workers, 10);
        assert_eq!(cfg.scheduler.history_retention_days, 90);
        assert_eq!(cfg.execution.default_timeout_secs, 300);
        assert_eq!(cfg.execution.output_cap_bytes, 100 * 1024);
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: TaskClawConfig = toml::from_str(
            "[scheduler]\nmax_workers = 4\n\n[execution]\nretry_delay_secs = 5\n",
        )
        .unwrap();
        assert_eq!(cfg.scheduler.max_workers, 4);
        assert_eq!(cfg.scheduler.tick_interval_secs, 2);
        assert_eq!(cfg.execution.retry_delay_secs, 5);
        assert_eq!(cfg.execution.max_retries, 3);
    }

    #[test]
    fn test_db_path_fallback() {
        let cfg = DatabaseConfig::default();
        assert!(cfg.resolve_path().ends_with("taskclaw.db"));
        let cfg = DatabaseConfig { path: "/tmp/x.db".into() };
        assert_eq!(cfg.resolve_path(), PathBuf::from("/tmp/x.db"));
    }
}
