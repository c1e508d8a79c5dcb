//! SQLite-backed persistence for tasks and the execution log.
//! Survives restarts; one connection behind a mutex, RFC3339 text timestamps.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use taskclaw_core::error::{Result, TaskClawError};

use crate::store::{ExecutionStore, ExecutionUpdate, TaskStore, apply_transition};
use crate::tasks::{Execution, ExecutionStatus, Schedule, Task};

/// SQLite-backed store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<rusqlite::Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| TaskClawError::Store(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        db.recover_interrupted()?;
        Ok(db)
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| TaskClawError::Store(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "
            -- Task definitions
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                command TEXT NOT NULL,
                schedule_kind TEXT NOT NULL,     -- 'cron', 'interval', 'once'
                schedule_data TEXT NOT NULL,      -- JSON: {expression:...} / {every_secs:...} / {at:...}
                timezone TEXT NOT NULL DEFAULT 'UTC',
                timeout_secs INTEGER NOT NULL DEFAULT 300,
                max_retries INTEGER NOT NULL DEFAULT 3,
                priority INTEGER NOT NULL DEFAULT 5,
                dependencies TEXT NOT NULL DEFAULT '[]',  -- JSON array of task ids
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_run_at TEXT,
                next_run_at TEXT,
                run_count INTEGER NOT NULL DEFAULT 0
            );

            -- Append-only execution log
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                exit_code INTEGER,
                stdout TEXT,
                stderr TEXT,
                error TEXT,
                duration_secs INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_executions_task
                ON executions(task_id, created_at);
         ",
            )
            .map_err(|e| TaskClawError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Close out executions a previous process left non-terminal. Without
    /// this, a crash strands a `running` row as the task's latest status and
    /// every dependent gates WAIT on it until starvation, forever.
    fn recover_interrupted(&self) -> Result<()> {
        let swept = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE executions
                 SET status = 'cancelled', ended_at = ?1,
                     error = COALESCE(error, 'Interrupted by restart')
                 WHERE status IN ('pending', 'running')",
                [Utc::now().to_rfc3339()],
            )
            .map_err(|e| TaskClawError::Store(format!("Recovery sweep: {e}")))?;
        if swept > 0 {
            tracing::warn!("🧹 Marked {swept} interrupted execution(s) cancelled");
        }
        Ok(())
    }
}

const TASK_COLUMNS: &str = "id, name, description, command, schedule_kind, schedule_data, \
     timezone, timeout_secs, max_retries, priority, dependencies, enabled, \
     created_at, last_run_at, next_run_at, run_count";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let schedule_kind: String = row.get(4)?;
    let schedule_data: String = row.get(5)?;
    let data: serde_json::Value = serde_json::from_str(&schedule_data).unwrap_or_default();

    let schedule = match schedule_kind.as_str() {
        "once" => {
            let at = data["at"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Schedule::Once { at }
        }
        "cron" => Schedule::Cron {
            expression: data["expression"].as_str().unwrap_or("0 * * * *").to_string(),
        },
        _ => Schedule::Interval {
            every_secs: data["every_secs"].as_u64().unwrap_or(3600),
        },
    };

    let dependencies: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(10)?).unwrap_or_default();

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        command: row.get(3)?,
        schedule,
        timezone: row.get(6)?,
        timeout_secs: row.get::<_, i64>(7)? as u64,
        max_retries: row.get::<_, i64>(8)? as u32,
        priority: row.get::<_, i64>(9)? as u8,
        dependencies,
        enabled: row.get::<_, i64>(11)? != 0,
        created_at: parse_time(row.get::<_, String>(12)?),
        last_run_at: row.get::<_, Option<String>>(13)?.and_then(parse_time_opt),
        next_run_at: row.get::<_, Option<String>>(14)?.and_then(parse_time_opt),
        run_count: row.get::<_, i64>(15)? as u32,
    })
}

const EXECUTION_COLUMNS: &str = "id, task_id, status, attempt, created_at, started_at, ended_at, \
     exit_code, stdout, stderr, error, duration_secs";

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(2)?;
    Ok(Execution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
        attempt: row.get::<_, i64>(3)? as u32,
        created_at: parse_time(row.get::<_, String>(4)?),
        started_at: row.get::<_, Option<String>>(5)?.and_then(parse_time_opt),
        ended_at: row.get::<_, Option<String>>(6)?.and_then(parse_time_opt),
        exit_code: row.get(7)?,
        stdout: row.get(8)?,
        stderr: row.get(9)?,
        error: row.get(10)?,
        duration_secs: row.get(11)?,
    })
}

fn parse_time(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_time_opt(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn store_err(e: rusqlite::Error) -> TaskClawError {
    TaskClawError::Store(e.to_string())
}

impl TaskStore for SchedulerDb {
    fn upsert_task(&self, task: &Task) -> Result<()> {
        let (kind, data) = match &task.schedule {
            Schedule::Once { at } => ("once", serde_json::json!({"at": at.to_rfc3339()})),
            Schedule::Cron { expression } => {
                ("cron", serde_json::json!({"expression": expression}))
            }
            Schedule::Interval { every_secs } => {
                ("interval", serde_json::json!({"every_secs": every_secs}))
            }
        };
        let dependencies = serde_json::to_string(&task.dependencies)
            .map_err(|e| TaskClawError::Store(format!("Serialize dependencies: {e}")))?;

        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT OR REPLACE INTO tasks
                 (id, name, description, command, schedule_kind, schedule_data, timezone,
                  timeout_secs, max_retries, priority, dependencies, enabled,
                  created_at, last_run_at, next_run_at, run_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                rusqlite::params![
                    task.id,
                    task.name,
                    task.description,
                    task.command,
                    kind,
                    data.to_string(),
                    task.timezone,
                    task.timeout_secs as i64,
                    task.max_retries as i64,
                    task.priority as i64,
                    dependencies,
                    task.enabled as i32,
                    task.created_at.to_rfc3339(),
                    task.last_run_at.map(|t| t.to_rfc3339()),
                    task.next_run_at.map(|t| t.to_rfc3339()),
                    task.run_count as i64,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map([id], task_from_row)
            .map_err(store_err)?
            .filter_map(|r| r.ok());
        Ok(rows.next())
    }

    fn all_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at"
            ))
            .map_err(store_err)?;
        let rows = stmt.query_map([], task_from_row).map_err(store_err)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn due_tasks(&self, before: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY priority ASC, next_run_at ASC"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map([before.to_rfc3339()], task_from_row)
            .map_err(store_err)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn update_schedule_state(&self, task: &Task) -> Result<()> {
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE tasks SET next_run_at = ?2, last_run_at = ?3, enabled = ?4, run_count = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    task.id,
                    task.next_run_at.map(|t| t.to_rfc3339()),
                    task.last_run_at.map(|t| t.to_rfc3339()),
                    task.enabled as i32,
                    task.run_count as i64,
                ],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(TaskClawError::Store(format!("Unknown task: {}", task.id)));
        }
        Ok(())
    }

    fn remove_task(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM tasks WHERE id = ?1", [id])
            .map_err(store_err)?;
        Ok(changed > 0)
    }
}

impl ExecutionStore for SchedulerDb {
    fn create_execution(&self, task_id: &str) -> Result<Execution> {
        let execution = Execution::new(task_id);
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO executions (id, task_id, status, attempt, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    execution.id,
                    execution.task_id,
                    execution.status.as_str(),
                    execution.attempt as i64,
                    execution.created_at.to_rfc3339(),
                ],
            )
            .map_err(store_err)?;
        Ok(execution)
    }

    fn transition(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut execution = {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"
                ))
                .map_err(store_err)?;
            stmt.query_map([execution_id], execution_from_row)
                .map_err(store_err)?
                .filter_map(|r| r.ok())
                .next()
                .ok_or_else(|| {
                    TaskClawError::Store(format!("Unknown execution: {execution_id}"))
                })?
        };

        apply_transition(&mut execution, status, update)?;

        conn.execute(
            "UPDATE executions SET status = ?2, attempt = ?3, started_at = ?4, ended_at = ?5,
                 exit_code = ?6, stdout = ?7, stderr = ?8, error = ?9, duration_secs = ?10
             WHERE id = ?1",
            rusqlite::params![
                execution.id,
                execution.status.as_str(),
                execution.attempt as i64,
                execution.started_at.map(|t| t.to_rfc3339()),
                execution.ended_at.map(|t| t.to_rfc3339()),
                execution.exit_code,
                execution.stdout,
                execution.stderr,
                execution.error,
                execution.duration_secs,
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"
            ))
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map([id], execution_from_row)
            .map_err(store_err)?
            .filter_map(|r| r.ok());
        Ok(rows.next())
    }

    fn latest_status(&self, task_id: &str) -> Result<Option<ExecutionStatus>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT status FROM executions WHERE task_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            )
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map([task_id], |row| row.get::<_, String>(0))
            .map_err(store_err)?
            .filter_map(|r| r.ok());
        match rows.next() {
            Some(s) => Ok(Some(ExecutionStatus::parse(&s)?)),
            None => Ok(None),
        }
    }

    fn recent_executions(&self, task_id: &str, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions WHERE task_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params![task_id, limit as i64],
                execution_from_row,
            )
            .map_err(store_err)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM executions
                 WHERE created_at < ?1 AND status NOT IN ('pending', 'running')",
                [before.to_rfc3339()],
            )
            .map_err(store_err)?;
        Ok(removed)
    }
}
