//! # TaskClaw Core
//!
//! Shared foundation for the TaskClaw workspace: configuration loading and the
//! crate-wide error taxonomy. Kept dependency-light so every other crate can
//! pull it in without cycles.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, ExecutionConfig, SchedulerConfig, TaskClawConfig};
pub use error::{Result, TaskClawError};
