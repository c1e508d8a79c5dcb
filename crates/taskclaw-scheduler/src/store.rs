//! Store boundary — what the core needs from the persistence collaborator.
//!
//! Two implementations: [`MemoryStore`] here (tests, embedding) and the
//! SQLite-backed [`crate::persistence::SchedulerDb`]. Writes for one
//! execution are strictly ordered — status regression is rejected.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use taskclaw_core::error::{Result, TaskClawError};

use crate::tasks::{Execution, ExecutionStatus, Task};

/// Fields written alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub attempt: Option<u32>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    pub duration_secs: Option<i64>,
}

/// Task definition reads/writes the scheduler loop needs.
pub trait TaskStore: Send + Sync {
    fn upsert_task(&self, task: &Task) -> Result<()>;
    fn get_task(&self, id: &str) -> Result<Option<Task>>;
    fn all_tasks(&self) -> Result<Vec<Task>>;
    /// Enabled tasks with `next_run_at <= before`, ordered by priority
    /// (lower first) then due time.
    fn due_tasks(&self, before: DateTime<Utc>) -> Result<Vec<Task>>;
    /// Persist the loop-owned fields: next_run_at, last_run_at, enabled,
    /// run_count.
    fn update_schedule_state(&self, task: &Task) -> Result<()>;
    fn remove_task(&self, id: &str) -> Result<bool>;
}

/// Append-only execution log operations.
pub trait ExecutionStore: Send + Sync {
    /// Append a new execution in Pending.
    fn create_execution(&self, task_id: &str) -> Result<Execution>;
    /// Move an execution forward through its lifecycle. Regressions error.
    fn transition(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<()>;
    fn get_execution(&self, id: &str) -> Result<Option<Execution>>;
    /// Point read of the most recent execution's status for a task.
    fn latest_status(&self, task_id: &str) -> Result<Option<ExecutionStatus>>;
    /// Most recent executions for a task, newest first.
    fn recent_executions(&self, task_id: &str, limit: usize) -> Result<Vec<Execution>>;
    /// Delete terminal executions created before `before`. Returns how many
    /// were removed. Non-terminal rows are never pruned.
    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// Full store boundary consumed by the engine.
pub trait Store: TaskStore + ExecutionStore {}
impl<T: TaskStore + ExecutionStore> Store for T {}

/// Apply a transition to an execution value, enforcing write ordering.
/// Shared by both store implementations.
pub(crate) fn apply_transition(
    execution: &mut Execution,
    status: ExecutionStatus,
    update: ExecutionUpdate,
) -> Result<()> {
    if !execution.status.can_transition(status) {
        return Err(TaskClawError::Store(format!(
            "Illegal execution transition {} -> {} ({})",
            execution.status, status, execution.id
        )));
    }
    execution.status = status;
    let now = Utc::now();
    if status == ExecutionStatus::Running {
        execution.started_at = Some(now);
    }
    if status.is_terminal() {
        execution.ended_at = Some(now);
    }
    if let Some(attempt) = update.attempt {
        execution.attempt = attempt;
    }
    if update.exit_code.is_some() {
        execution.exit_code = update.exit_code;
    }
    if update.stdout.is_some() {
        execution.stdout = update.stdout;
    }
    if update.stderr.is_some() {
        execution.stderr = update.stderr;
    }
    if update.error.is_some() {
        execution.error = update.error;
    }
    if update.duration_secs.is_some() {
        execution.duration_secs = update.duration_secs;
    }
    Ok(())
}

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<String, Task>,
    /// Append-only execution log, oldest first.
    executions: Vec<Execution>,
}

/// In-memory store. Used in tests and for embedding without persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn upsert_task(&self, task: &Task) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.inner.lock().unwrap().tasks.get(id).cloned())
    }

    fn all_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.inner.lock().unwrap().tasks.values().cloned().collect())
    }

    fn due_tasks(&self, before: DateTime<Utc>) -> Result<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.is_due(before))
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.priority, t.next_run_at));
        Ok(due)
    }

    fn update_schedule_state(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| TaskClawError::Store(format!("Unknown task: {}", task.id)))?;
        stored.next_run_at = task.next_run_at;
        stored.last_run_at = task.last_run_at;
        stored.enabled = task.enabled;
        stored.run_count = task.run_count;
        Ok(())
    }

    fn remove_task(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().tasks.remove(id).is_some())
    }
}

impl ExecutionStore for MemoryStore {
    fn create_execution(&self, task_id: &str) -> Result<Execution> {
        let execution = Execution::new(task_id);
        self.inner
            .lock()
            .unwrap()
            .executions
            .push(execution.clone());
        Ok(execution)
    }

    fn transition(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner
            .executions
            .iter_mut()
            .rev()
            .find(|e| e.id == execution_id)
            .ok_or_else(|| TaskClawError::Store(format!("Unknown execution: {execution_id}")))?;
        apply_transition(execution, status, update)
    }

    fn get_execution(&self, id: &str) -> Result<Option<Execution>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    fn latest_status(&self, task_id: &str) -> Result<Option<ExecutionStatus>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .rev()
            .find(|e| e.task_id == task_id)
            .map(|e| e.status))
    }

    fn recent_executions(&self, task_id: &str, limit: usize) -> Result<Vec<Execution>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .iter()
            .rev()
            .filter(|e| e.task_id == task_id)
            .take(limit)
            .cloned()
            .collect())
    }

    fn prune_executions(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let total = inner.executions.len();
        inner
            .executions
            .retain(|e| e.created_at >= before || !e.status.is_terminal());
        Ok(total - inner.executions.len())
    }
}
