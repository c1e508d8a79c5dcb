//! Task and execution data model — the core types for scheduled work.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use taskclaw_core::error::{Result, TaskClawError};

use crate::cron::CronExpr;

/// A scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Shell command passed to the execution environment.
    pub command: String,
    /// When/how to trigger.
    pub schedule: Schedule,
    /// Timezone for cron evaluation: "UTC" or a fixed offset like "+07:00".
    pub timezone: String,
    /// Per-attempt timeout in seconds.
    pub timeout_secs: u64,
    /// Retry bound: total attempts per due-occurrence = max_retries + 1.
    pub max_retries: u32,
    /// Tie-break hint, 1–10; lower dispatches first. Not a hard guarantee.
    pub priority: u8,
    /// Direct dependency task ids. All must have completed for this to run.
    pub dependencies: Vec<String>,
    /// Whether the task is considered by the scheduler at all.
    pub enabled: bool,
    /// Created timestamp.
    pub created_at: DateTime<Utc>,
    /// Last time a run was dispatched.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time. None means no further occurrence.
    pub next_run_at: Option<DateTime<Utc>>,
    /// How many occurrences have been dispatched.
    pub run_count: u32,
}

/// How/when the task triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
    /// Run once at a specific time.
    Once { at: DateTime<Utc> },
    /// Run on a 5-field cron expression.
    Cron { expression: String },
    /// Run every N seconds.
    Interval { every_secs: u64 },
}

/// Schedule kind tag, used at the API/persistence boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Cron => "cron",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cron" => Ok(ScheduleKind::Cron),
            "interval" => Ok(ScheduleKind::Interval),
            "once" => Ok(ScheduleKind::Once),
            other => Err(TaskClawError::InvalidSchedule(format!(
                "Unknown schedule kind: '{other}'"
            ))),
        }
    }
}

impl Schedule {
    /// Parse and validate a schedule definition. This is the only path that
    /// should construct schedules from user input — malformed expressions are
    /// rejected here, at definition time, never at dispatch time.
    pub fn parse(kind: ScheduleKind, value: &str) -> Result<Self> {
        match kind {
            ScheduleKind::Cron => {
                CronExpr::parse(value)?;
                Ok(Schedule::Cron {
                    expression: value.to_string(),
                })
            }
            ScheduleKind::Interval => {
                let every_secs = parse_interval(value)?;
                Ok(Schedule::Interval { every_secs })
            }
            ScheduleKind::Once => {
                let at = DateTime::parse_from_rfc3339(value)
                    .map_err(|e| {
                        TaskClawError::InvalidSchedule(format!(
                            "Invalid timestamp '{value}': {e}"
                        ))
                    })?
                    .with_timezone(&Utc);
                Ok(Schedule::Once { at })
            }
        }
    }

    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::Cron { .. } => ScheduleKind::Cron,
            Schedule::Interval { .. } => ScheduleKind::Interval,
            Schedule::Once { .. } => ScheduleKind::Once,
        }
    }

    /// Re-validate a schedule (used when task definitions are loaded or edited).
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Cron { expression } => CronExpr::parse(expression).map(|_| ()),
            Schedule::Interval { every_secs } => {
                if *every_secs == 0 {
                    Err(TaskClawError::InvalidSchedule(
                        "Interval must be positive".into(),
                    ))
                } else {
                    Ok(())
                }
            }
            Schedule::Once { .. } => Ok(()),
        }
    }

    /// Compute the next occurrence strictly after `after`, evaluating cron
    /// fields in the given offset. `Ok(None)` is the "no further occurrence"
    /// sentinel — the caller must disable the task.
    pub fn next_after(
        &self,
        after: DateTime<Utc>,
        tz: FixedOffset,
    ) -> Result<Option<DateTime<Utc>>> {
        match self {
            Schedule::Once { at } => Ok(if *at > after { Some(*at) } else { None }),
            Schedule::Interval { every_secs } => {
                // A deserialized schedule may not have gone through parse;
                // reject intervals past what chrono can represent instead of
                // panicking in the cast or the addition.
                let step = i64::try_from(*every_secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .ok_or_else(|| {
                        TaskClawError::InvalidSchedule(format!(
                            "Interval too large: {every_secs}s"
                        ))
                    })?;
                after.checked_add_signed(step).map(Some).ok_or_else(|| {
                    TaskClawError::InvalidSchedule(format!("Interval too large: {every_secs}s"))
                })
            }
            Schedule::Cron { expression } => {
                let expr = CronExpr::parse(expression)?;
                let local = after.with_timezone(&tz);
                Ok(expr.next_after(local).map(|t| t.with_timezone(&Utc)))
            }
        }
    }
}

/// Parse an interval string: `<positive integer><unit>`, unit ∈ {s, m, h, d}.
fn parse_interval(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.len() < 2 || !value.is_ascii() {
        return Err(TaskClawError::InvalidSchedule(format!(
            "Invalid interval '{value}' (expected e.g. \"30s\", \"5m\", \"1h\", \"2d\")"
        )));
    }
    let (magnitude, unit) = value.split_at(value.len() - 1);
    let n: u64 = magnitude.parse().map_err(|_| {
        TaskClawError::InvalidSchedule(format!("Invalid interval magnitude: '{magnitude}'"))
    })?;
    if n == 0 {
        return Err(TaskClawError::InvalidSchedule(
            "Interval must be positive".into(),
        ));
    }
    let secs = match unit {
        "s" => Some(n),
        "m" => n.checked_mul(60),
        "h" => n.checked_mul(3600),
        "d" => n.checked_mul(86400),
        other => {
            return Err(TaskClawError::InvalidSchedule(format!(
                "Unknown interval unit: '{other}'"
            )));
        }
    };
    secs.ok_or_else(|| TaskClawError::InvalidSchedule(format!("Interval too large: '{value}'")))
}

/// Parse a task timezone string into a fixed offset.
/// Accepts "UTC", "Z", "" or "±HH:MM".
pub fn parse_timezone(s: &str) -> Result<FixedOffset> {
    match s {
        "" | "UTC" | "utc" | "Z" => Ok(FixedOffset::east_opt(0).unwrap()),
        other => other.parse::<FixedOffset>().map_err(|e| {
            TaskClawError::InvalidSchedule(format!("Invalid timezone '{other}': {e}"))
        }),
    }
}

impl Task {
    /// Create a task with defaults for the tuning knobs.
    pub fn new(name: &str, command: &str, schedule: Schedule) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: None,
            command: command.to_string(),
            schedule,
            timezone: "UTC".to_string(),
            timeout_secs: 300,
            max_retries: 3,
            priority: 5,
            dependencies: Vec::new(),
            enabled: true,
            created_at: Utc::now(),
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
        }
    }

    /// Create a one-time task.
    pub fn once(name: &str, command: &str, at: DateTime<Utc>) -> Self {
        let mut task = Self::new(name, command, Schedule::Once { at });
        task.next_run_at = Some(at);
        task
    }

    /// Create a recurring interval task.
    pub fn interval(name: &str, command: &str, every_secs: u64) -> Self {
        let mut task = Self::new(name, command, Schedule::Interval { every_secs });
        let tz = FixedOffset::east_opt(0).unwrap();
        task.next_run_at = task.schedule.next_after(Utc::now(), tz).ok().flatten();
        task
    }

    /// Create a cron-scheduled task. `next_run_at` is computed by the engine.
    pub fn cron(name: &str, command: &str, expression: &str) -> Self {
        Self::new(
            name,
            command,
            Schedule::Cron {
                expression: expression.to_string(),
            },
        )
    }

    /// Validate the definition fields the trigger calculator depends on.
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;
        parse_timezone(&self.timezone)?;
        Ok(())
    }

    /// Whether the task is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }
}

/// Execution status lifecycle:
/// `Pending → Running → {Completed, Failed, TimedOut, Cancelled, Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timed_out" => Ok(ExecutionStatus::TimedOut),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "skipped" => Ok(ExecutionStatus::Skipped),
            other => Err(TaskClawError::Store(format!(
                "Unknown execution status: '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            _ => 2,
        }
    }

    /// Status writes must be strictly ordered: an execution can only move
    /// forward through the lifecycle, never regress.
    pub fn can_transition(&self, to: ExecutionStatus) -> bool {
        to.rank() > self.rank()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete attempt (with internal retries) to run a task for one due
/// occurrence. Append-only; immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    /// 1-based attempt counter; holds the final attempt count once terminal.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    pub duration_secs: Option<i64>,
}

impl Execution {
    pub fn new(task_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            status: ExecutionStatus::Pending,
            attempt: 1,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
            duration_secs: None,
        }
    }
}
