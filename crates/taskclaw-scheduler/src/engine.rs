//! Scheduler engine — the loop that finds due tasks, gates them on their
//! dependencies, and dispatches them through a bounded worker pool.
//!
//! Single loop per process, ticking on a tokio interval. The tick itself only
//! does fast point reads; subprocess supervision runs on spawned tasks so one
//! slow command never delays evaluation of the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;

use taskclaw_core::config::{ExecutionConfig, SchedulerConfig};
use taskclaw_core::error::{Result, TaskClawError};

use crate::gate::{self, DepState, GateDecision};
use crate::notify::{EventKind, EventRouter, TaskEvent};
use crate::runner::{ExecutionRunner, RunnerConfig};
use crate::store::{ExecutionUpdate, Store};
use crate::tasks::{Execution, ExecutionStatus, Task, parse_timezone};

/// The one piece of mutable state shared between ticks and executions:
/// which tasks are running right now, and how many worker slots are free.
/// All access goes through [`admit`](RunRegistry::admit); the returned guard
/// releases both on drop, so a panicking execution still frees its slot.
struct RunRegistry {
    /// task id -> execution id (empty until the execution record exists).
    running: Mutex<HashMap<String, String>>,
    slots: Arc<Semaphore>,
}

enum Admission {
    Admitted(RunGuard),
    AlreadyRunning,
    Saturated,
}

struct RunGuard {
    registry: Arc<RunRegistry>,
    task_id: String,
    _permit: OwnedSemaphorePermit,
}

impl RunGuard {
    /// Record the execution id for this slot (for cancellation at shutdown).
    fn bind(&self, execution_id: &str) {
        if let Some(slot) = self
            .registry
            .running
            .lock()
            .unwrap()
            .get_mut(&self.task_id)
        {
            *slot = execution_id.to_string();
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.running.lock().unwrap().remove(&self.task_id);
    }
}

impl RunRegistry {
    fn new(max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(max_workers.max(1))),
        })
    }

    fn is_running(&self, task_id: &str) -> bool {
        self.running.lock().unwrap().contains_key(task_id)
    }

    fn active(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    fn running_executions(&self) -> Vec<(String, String)> {
        self.running
            .lock()
            .unwrap()
            .iter()
            .map(|(t, e)| (t.clone(), e.clone()))
            .collect()
    }

    fn admit(self: &Arc<Self>, task_id: &str) -> Admission {
        let mut running = self.running.lock().unwrap();
        if running.contains_key(task_id) {
            return Admission::AlreadyRunning;
        }
        let permit = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Admission::Saturated,
        };
        running.insert(task_id.to_string(), String::new());
        Admission::Admitted(RunGuard {
            registry: Arc::clone(self),
            task_id: task_id.to_string(),
            _permit: permit,
        })
    }
}

/// Counts of what one tick did. Returned for observability and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Enabled tasks whose due time had arrived.
    pub due: usize,
    /// Handed to the worker pool.
    pub dispatched: usize,
    /// Occurrence dropped because a prior run was still in flight.
    pub dropped: usize,
    /// Deferred to the next tick because the pool was saturated.
    pub deferred: usize,
    /// Terminal Skipped written by the gate.
    pub skipped: usize,
    /// Left waiting on dependencies (due time preserved).
    pub waiting: usize,
    /// Terminal Failed written by the gate (unknown dependency, starvation).
    pub failed: usize,
}

/// The scheduler engine. Construct once, share via `Arc`.
pub struct SchedulerEngine {
    store: Arc<dyn Store>,
    runner: ExecutionRunner,
    events: Arc<EventRouter>,
    registry: Arc<RunRegistry>,
    scheduler_cfg: SchedulerConfig,
    /// When each task first gated WAIT, for the starvation horizon.
    waiting_since: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Last history-retention prune, at most once per day.
    last_prune: Mutex<Option<DateTime<Utc>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler_cfg: SchedulerConfig,
        execution_cfg: ExecutionConfig,
    ) -> Arc<Self> {
        let runner = ExecutionRunner::new(RunnerConfig {
            output_cap_bytes: execution_cfg.output_cap_bytes,
            retry_delay: Duration::from_secs(execution_cfg.retry_delay_secs),
        });
        Arc::new(Self {
            store,
            runner,
            events: Arc::new(EventRouter::new()),
            registry: RunRegistry::new(scheduler_cfg.max_workers),
            scheduler_cfg,
            waiting_since: Mutex::new(HashMap::new()),
            last_prune: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Arc<EventRouter> {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.scheduler_cfg
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Number of executions currently in flight.
    pub fn active_executions(&self) -> usize {
        self.registry.active()
    }

    /// Validate and register a task (create or edit). Recomputes
    /// `next_run_at` from now — never from a stale due time, so editing a
    /// schedule mid-cycle cannot unleash a storm of back-dated triggers.
    pub fn add_task(&self, mut task: Task) -> Result<Task> {
        task.validate()?;

        let mut all = self.store.all_tasks()?;
        all.retain(|t| t.id != task.id);
        all.push(task.clone());
        gate::check_cycles(&all)?;

        let tz = parse_timezone(&task.timezone)?;
        task.next_run_at = task.schedule.next_after(Utc::now(), tz)?;
        if task.next_run_at.is_none() {
            task.enabled = false;
            tracing::warn!(
                "Task '{}' has no future occurrence; stored disabled",
                task.name
            );
        }

        self.store.upsert_task(&task)?;
        // Edits reset any accumulated wait; the horizon restarts from the
        // next WAIT verdict.
        self.waiting_since.lock().unwrap().remove(&task.id);
        tracing::info!("📅 Task registered: '{}' ({})", task.name, task.id);
        Ok(task)
    }

    /// Remove a task definition.
    pub fn remove_task(&self, id: &str) -> Result<bool> {
        self.waiting_since.lock().unwrap().remove(id);
        self.store.remove_task(id)
    }

    /// Enable or disable a task. Enabling recomputes `next_run_at` from now.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut task = self
            .store
            .get_task(id)?
            .ok_or_else(|| TaskClawError::Store(format!("Unknown task: {id}")))?;
        self.waiting_since.lock().unwrap().remove(id);
        task.enabled = enabled;
        if enabled {
            let tz = parse_timezone(&task.timezone)?;
            task.next_run_at = task.schedule.next_after(Utc::now(), tz)?;
            if task.next_run_at.is_none() {
                task.enabled = false;
            }
        }
        self.store.update_schedule_state(&task)
    }

    /// One scheduler tick: evaluate every enabled task due at `now`.
    /// A single bad task never stops evaluation of the others.
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> TickStats {
        let mut stats = TickStats::default();
        self.handles.lock().unwrap().retain(|h| !h.is_finished());
        self.maybe_prune(now);

        let due = match self.store.due_tasks(now) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("⚠️ Due-task scan failed: {e}");
                return stats;
            }
        };
        stats.due = due.len();

        for task in due {
            // Prior run still in flight: drop this occurrence (never queue)
            // and advance the due time so it does not re-trigger every tick.
            if self.registry.is_running(&task.id) {
                tracing::debug!("Task '{}' still running; occurrence dropped", task.name);
                let mut task = task;
                self.advance_schedule(&mut task, now, false);
                stats.dropped += 1;
                continue;
            }

            match gate::evaluate(&task, |dep_id| self.dep_state(dep_id)) {
                GateDecision::Run => {
                    self.waiting_since.lock().unwrap().remove(&task.id);
                    match self.dispatch(task, now) {
                        DispatchResult::Dispatched => stats.dispatched += 1,
                        DispatchResult::Deferred => stats.deferred += 1,
                        DispatchResult::Dropped => stats.dropped += 1,
                    }
                }
                GateDecision::Wait(reason) => {
                    if self.starved(&task.id, now) {
                        self.waiting_since.lock().unwrap().remove(&task.id);
                        let error = TaskClawError::Starvation(reason).to_string();
                        tracing::warn!("⏳ Task '{}' starved: {error}", task.name);
                        let mut task = task;
                        self.record_gated(&task, ExecutionStatus::Failed, EventKind::Failed, error);
                        self.advance_schedule(&mut task, now, false);
                        stats.failed += 1;
                    } else {
                        // Due time preserved — re-evaluated next tick.
                        tracing::debug!("Task '{}' waiting: {reason}", task.name);
                        stats.waiting += 1;
                    }
                }
                GateDecision::Skip(reason) => {
                    self.waiting_since.lock().unwrap().remove(&task.id);
                    tracing::info!("⏭️ Task '{}' skipped: {reason}", task.name);
                    let mut task = task;
                    self.record_gated(&task, ExecutionStatus::Skipped, EventKind::Skipped, reason);
                    self.advance_schedule(&mut task, now, false);
                    stats.skipped += 1;
                }
                GateDecision::Fail(reason) => {
                    self.waiting_since.lock().unwrap().remove(&task.id);
                    tracing::warn!("❌ Task '{}' gate failure: {reason}", task.name);
                    let mut task = task;
                    self.record_gated(&task, ExecutionStatus::Failed, EventKind::Failed, reason);
                    self.advance_schedule(&mut task, now, false);
                    stats.failed += 1;
                }
            }
        }

        stats
    }

    /// Wait for in-flight executions to drain, then cancel stragglers.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.scheduler_cfg.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        while self.registry.active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let leftover = self.registry.running_executions();
        if leftover.is_empty() {
            tracing::info!("🛑 Scheduler drained cleanly");
            return;
        }

        tracing::warn!(
            "🛑 Grace period elapsed with {} executions in flight; cancelling",
            leftover.len()
        );
        // Aborting drops the run future: the guard releases its slot and
        // kill_on_drop reaps the subprocess.
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        for (task_id, execution_id) in leftover {
            if execution_id.is_empty() {
                continue;
            }
            let update = ExecutionUpdate {
                error: Some("Cancelled at shutdown".into()),
                ..Default::default()
            };
            // A run that won the race to a terminal status is left as-is.
            if self
                .store
                .transition(&execution_id, ExecutionStatus::Cancelled, update)
                .is_ok()
            {
                tracing::info!("Execution {execution_id} (task {task_id}) cancelled");
            }
        }
    }

    fn dep_state(&self, dep_id: &str) -> DepState {
        match self.store.get_task(dep_id) {
            Ok(Some(_)) => match self.store.latest_status(dep_id) {
                Ok(Some(status)) => DepState::Latest(status),
                Ok(None) => DepState::NeverRan,
                Err(e) => {
                    tracing::error!("⚠️ Status lookup for dependency {dep_id} failed: {e}");
                    DepState::NeverRan
                }
            },
            Ok(None) => DepState::Unknown,
            Err(e) => {
                tracing::error!("⚠️ Lookup for dependency {dep_id} failed: {e}");
                DepState::NeverRan
            }
        }
    }

    /// Prune execution history past the retention window, at most once per
    /// day (the first tick after startup counts).
    fn maybe_prune(&self, now: DateTime<Utc>) {
        let days = self.scheduler_cfg.history_retention_days;
        if days == 0 {
            return;
        }
        {
            let mut last = self.last_prune.lock().unwrap();
            if last.is_some_and(|t| now - t < chrono::Duration::hours(24)) {
                return;
            }
            *last = Some(now);
        }
        let cutoff = now - chrono::Duration::days(days as i64);
        match self.store.prune_executions(cutoff) {
            Ok(0) => {}
            Ok(n) => tracing::info!("🧹 Pruned {n} execution record(s) older than {days} days"),
            Err(e) => tracing::error!("⚠️ History prune failed: {e}"),
        }
    }

    fn starved(&self, task_id: &str, now: DateTime<Utc>) -> bool {
        let mut waiting = self.waiting_since.lock().unwrap();
        let since = *waiting.entry(task_id.to_string()).or_insert(now);
        now - since >= chrono::Duration::seconds(self.scheduler_cfg.wait_horizon_secs as i64)
    }

    /// Write a terminal execution for a gate outcome — no subprocess spawned.
    fn record_gated(
        &self,
        task: &Task,
        status: ExecutionStatus,
        kind: EventKind,
        reason: String,
    ) {
        let execution = match self.store.create_execution(&task.id) {
            Ok(execution) => execution,
            Err(e) => {
                tracing::error!("⚠️ Could not record {status} for '{}': {e}", task.name);
                return;
            }
        };
        let update = ExecutionUpdate {
            error: Some(reason.clone()),
            ..Default::default()
        };
        if let Err(e) = self.store.transition(&execution.id, status, update) {
            tracing::error!("⚠️ Could not finalize {status} for '{}': {e}", task.name);
        }
        self.events
            .emit(TaskEvent::new(&task.id, &execution.id, kind, Some(reason)));
    }

    fn dispatch(self: &Arc<Self>, mut task: Task, now: DateTime<Utc>) -> DispatchResult {
        let guard = match self.registry.admit(&task.id) {
            Admission::Admitted(guard) => guard,
            // Checked at the top of the tick; a run finishing in between
            // only makes admission succeed.
            Admission::AlreadyRunning => return DispatchResult::Dropped,
            // Pool exhausted: defer without consuming the occurrence.
            Admission::Saturated => {
                tracing::debug!("Worker pool saturated; task '{}' deferred", task.name);
                return DispatchResult::Deferred;
            }
        };

        let execution = match self.store.create_execution(&task.id) {
            Ok(execution) => execution,
            Err(e) => {
                tracing::error!("⚠️ Could not create execution for '{}': {e}", task.name);
                return DispatchResult::Deferred;
            }
        };
        guard.bind(&execution.id);

        self.advance_schedule(&mut task, now, true);

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            engine.run_execution(task, execution, guard).await;
        });
        self.handles.lock().unwrap().push(handle);
        DispatchResult::Dispatched
    }

    async fn run_execution(&self, task: Task, execution: Execution, _guard: RunGuard) {
        if let Err(e) =
            self.store
                .transition(&execution.id, ExecutionStatus::Running, Default::default())
        {
            tracing::error!("⚠️ Could not mark execution {} running: {e}", execution.id);
            // Best effort: do not strand the record in Pending with no
            // terminal event.
            let error = format!("Could not start: {e}");
            let update = ExecutionUpdate {
                error: Some(error.clone()),
                ..Default::default()
            };
            if let Err(e) = self
                .store
                .transition(&execution.id, ExecutionStatus::Failed, update)
            {
                tracing::error!("⚠️ Could not finalize execution {}: {e}", execution.id);
            }
            self.events.emit(TaskEvent::new(
                &task.id,
                &execution.id,
                EventKind::Failed,
                Some(error),
            ));
            return;
        }
        self.events.emit(TaskEvent::new(
            &task.id,
            &execution.id,
            EventKind::Started,
            None,
        ));
        tracing::info!("🔔 Task '{}' started (execution {})", task.name, execution.id);

        let outcome = self.runner.run(&task).await;

        let kind = match outcome.status {
            ExecutionStatus::Completed => EventKind::Succeeded,
            ExecutionStatus::TimedOut => EventKind::TimedOut,
            _ => EventKind::Failed,
        };
        let update = ExecutionUpdate {
            attempt: Some(outcome.attempts),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            error: outcome.error.clone(),
            duration_secs: Some(outcome.duration_secs),
        };
        if let Err(e) = self.store.transition(&execution.id, outcome.status, update) {
            tracing::error!("⚠️ Could not finalize execution {}: {e}", execution.id);
        }
        self.events
            .emit(TaskEvent::new(&task.id, &execution.id, kind, outcome.error));

        match outcome.status {
            ExecutionStatus::Completed => {
                tracing::info!(
                    "✅ Task '{}' completed in {}s ({} attempt(s))",
                    task.name,
                    outcome.duration_secs,
                    outcome.attempts
                );
            }
            status => {
                tracing::warn!(
                    "❌ Task '{}' ended {status} after {} attempt(s)",
                    task.name,
                    outcome.attempts
                );
            }
        }
    }

    /// Recompute and persist the loop-owned schedule fields. A task with no
    /// further occurrence is disabled (the ONCE invariant).
    fn advance_schedule(&self, task: &mut Task, now: DateTime<Utc>, dispatched: bool) {
        let tz = parse_timezone(&task.timezone)
            .unwrap_or_else(|_| FixedOffset::east_opt(0).unwrap());
        let next = match task.schedule.next_after(now, tz) {
            Ok(next) => next,
            Err(e) => {
                tracing::error!("⚠️ Trigger computation failed for '{}': {e}", task.name);
                None
            }
        };
        task.next_run_at = next;
        if dispatched {
            task.last_run_at = Some(now);
            task.run_count += 1;
        }
        if next.is_none() {
            task.enabled = false;
        }
        if let Err(e) = self.store.update_schedule_state(task) {
            tracing::error!("⚠️ Could not persist schedule state for '{}': {e}", task.name);
        }
    }
}

enum DispatchResult {
    Dispatched,
    Deferred,
    Dropped,
}

/// Run the scheduler loop until the shutdown signal flips, then drain.
pub async fn spawn_scheduler(engine: Arc<SchedulerEngine>, mut shutdown: watch::Receiver<bool>) {
    let cfg = engine.config().clone();
    tracing::info!(
        "⏰ Scheduler started (tick every {}s, {} workers)",
        cfg.tick_interval_secs,
        cfg.max_workers
    );

    let mut interval =
        tokio::time::interval(Duration::from_secs(cfg.tick_interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                engine.tick(Utc::now());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    engine.shutdown().await;
    tracing::info!("⏰ Scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tasks::Schedule;

    fn test_engine(max_workers: usize, wait_horizon_secs: u64) -> Arc<SchedulerEngine> {
        let scheduler = SchedulerConfig {
            tick_interval_secs: 1,
            max_workers,
            wait_horizon_secs,
            shutdown_grace_secs: 1,
            history_retention_days: 0,
        };
        let execution = ExecutionConfig {
            default_timeout_secs: 5,
            max_retries: 3,
            retry_delay_secs: 0,
            output_cap_bytes: 4096,
        };
        SchedulerEngine::new(Arc::new(MemoryStore::new()), scheduler, execution)
    }

    fn due_task(store: &Arc<dyn Store>, name: &str, command: &str) -> Task {
        let mut task = Task::interval(name, command, 3600);
        task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(60));
        store.upsert_task(&task).unwrap();
        task
    }

    async fn wait_terminal(store: &Arc<dyn Store>, task_id: &str) -> ExecutionStatus {
        for _ in 0..100 {
            if let Some(status) = store.latest_status(task_id).unwrap() {
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("execution for {task_id} never reached a terminal status");
    }

    #[tokio::test]
    async fn test_registry_admission_and_release() {
        let registry = RunRegistry::new(1);
        let guard = match registry.admit("a") {
            Admission::Admitted(guard) => guard,
            _ => panic!("expected admission"),
        };
        assert!(registry.is_running("a"));
        assert!(matches!(registry.admit("a"), Admission::AlreadyRunning));
        assert!(matches!(registry.admit("b"), Admission::Saturated));

        drop(guard);
        assert!(!registry.is_running("a"));
        assert!(matches!(registry.admit("b"), Admission::Admitted(_)));
    }

    #[tokio::test]
    async fn test_registry_binds_execution_id() {
        let registry = RunRegistry::new(2);
        let guard = match registry.admit("a") {
            Admission::Admitted(guard) => guard,
            _ => panic!("expected admission"),
        };
        guard.bind("exec-1");
        assert_eq!(
            registry.running_executions(),
            vec![("a".to_string(), "exec-1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_tick_runs_task_with_no_dependencies() {
        let engine = test_engine(4, 3600);
        let store = engine.store();
        let task = due_task(&store, "hello", "echo hi");

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.due, 1);
        assert_eq!(stats.dispatched, 1);

        assert_eq!(wait_terminal(&store, &task.id).await, ExecutionStatus::Completed);
        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert!(stored.last_run_at.is_some());
        // Interval schedule advanced past now at dispatch.
        assert!(stored.next_run_at.unwrap() > Utc::now() - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_without_spawning() {
        let engine = test_engine(4, 3600);
        let store = engine.store();

        let dep = due_task(&store, "upstream", "false");
        let execution = store.create_execution(&dep.id).unwrap();
        store
            .transition(&execution.id, ExecutionStatus::Failed, Default::default())
            .unwrap();

        let mut downstream = due_task(&store, "downstream", "echo never");
        downstream.dependencies = vec![dep.id.clone()];
        store.upsert_task(&downstream).unwrap();
        // Keep upstream out of this tick.
        let mut dep = dep;
        dep.next_run_at = Some(Utc::now() + chrono::Duration::seconds(3600));
        store.update_schedule_state(&dep).unwrap();

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.dispatched, 0);

        let status = store.latest_status(&downstream.id).unwrap().unwrap();
        assert_eq!(status, ExecutionStatus::Skipped);
        // Missed occurrence is not retried: due time advanced.
        let stored = store.get_task(&downstream.id).unwrap().unwrap();
        assert!(stored.next_run_at.unwrap() > Utc::now());
        assert_eq!(stored.run_count, 0);
    }

    #[tokio::test]
    async fn test_pending_dependency_waits_preserving_due_time() {
        let engine = test_engine(4, 3600);
        let store = engine.store();

        let mut dep = due_task(&store, "upstream", "true");
        dep.next_run_at = Some(Utc::now() + chrono::Duration::seconds(3600));
        store.update_schedule_state(&dep).unwrap();

        let mut downstream = due_task(&store, "downstream", "echo later");
        downstream.dependencies = vec![dep.id.clone()];
        store.upsert_task(&downstream).unwrap();
        let due_before = downstream.next_run_at;

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.waiting, 1);
        // No execution record, due time untouched.
        assert!(store.latest_status(&downstream.id).unwrap().is_none());
        let stored = store.get_task(&downstream.id).unwrap().unwrap();
        assert_eq!(stored.next_run_at, due_before);
    }

    #[tokio::test]
    async fn test_wait_past_horizon_becomes_failed() {
        // Zero horizon: the first WAIT already starves.
        let engine = test_engine(4, 0);
        let store = engine.store();

        let mut dep = due_task(&store, "upstream-never-ran", "true");
        dep.next_run_at = Some(Utc::now() + chrono::Duration::seconds(3600));
        store.update_schedule_state(&dep).unwrap();

        let mut downstream = due_task(&store, "starving", "echo never");
        downstream.dependencies = vec![dep.id.clone()];
        store.upsert_task(&downstream).unwrap();

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.failed, 1);
        let execution = store
            .recent_executions(&downstream.id, 1)
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("Starved"));
    }

    #[tokio::test]
    async fn test_unknown_dependency_fails_execution() {
        let engine = test_engine(4, 3600);
        let store = engine.store();

        let mut task = due_task(&store, "dangling", "echo never");
        task.dependencies = vec!["no-such-task".into()];
        store.upsert_task(&task).unwrap();

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.failed, 1);
        assert_eq!(
            store.latest_status(&task.id).unwrap().unwrap(),
            ExecutionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_overlapping_occurrence_is_dropped() {
        let engine = test_engine(4, 3600);
        let store = engine.store();
        let task = due_task(&store, "sleeper", "sleep 5");

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.dispatched, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.active_executions(), 1);

        // Force the task due again while the first run is in flight.
        let mut stored = store.get_task(&task.id).unwrap().unwrap();
        stored.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.update_schedule_state(&stored).unwrap();

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.dispatched, 0);
        assert_eq!(store.recent_executions(&task.id, 10).unwrap().len(), 1);
        // The dropped occurrence still advanced the due time.
        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert!(stored.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_saturated_pool_defers_without_consuming_occurrence() {
        let engine = test_engine(1, 3600);
        let store = engine.store();

        let mut hog = due_task(&store, "hog", "sleep 5");
        hog.priority = 1;
        store.upsert_task(&hog).unwrap();
        let mut patient = due_task(&store, "patient", "echo hi");
        patient.priority = 9;
        store.upsert_task(&patient).unwrap();
        let patient_due = patient.next_run_at;

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.deferred, 1);

        // Deferred task kept its due time and produced no execution.
        let stored = store.get_task(&patient.id).unwrap().unwrap();
        assert_eq!(stored.next_run_at, patient_due);
        assert!(store.latest_status(&patient.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_once_task_disables_after_dispatch() {
        let engine = test_engine(4, 3600);
        let store = engine.store();

        let mut task = Task::new(
            "one-shot",
            "echo done",
            Schedule::Once {
                at: Utc::now() - chrono::Duration::seconds(10),
            },
        );
        task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(10));
        store.upsert_task(&task).unwrap();

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.dispatched, 1);

        assert_eq!(wait_terminal(&store, &task.id).await, ExecutionStatus::Completed);
        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert!(!stored.enabled);
        assert!(stored.next_run_at.is_none());

        // Disabled and past its single occurrence: never due again.
        let stats = engine.tick(Utc::now());
        assert_eq!(stats.due, 0);
    }

    #[tokio::test]
    async fn test_failing_command_retries_then_fails() {
        let engine = test_engine(4, 3600);
        let store = engine.store();

        let mut task = due_task(&store, "flaky", "exit 7");
        task.max_retries = 2;
        store.upsert_task(&task).unwrap();

        engine.tick(Utc::now());
        assert_eq!(wait_terminal(&store, &task.id).await, ExecutionStatus::Failed);
        let execution = store.recent_executions(&task.id, 1).unwrap().pop().unwrap();
        assert_eq!(execution.attempt, 3);
        assert_eq!(execution.exit_code, Some(7));
    }

    #[tokio::test]
    async fn test_events_emitted_for_lifecycle() {
        let engine = test_engine(4, 3600);
        let store = engine.store();
        let task = due_task(&store, "noisy", "echo hi");

        let mut events = engine.events().subscribe();
        engine.tick(Utc::now());
        wait_terminal(&store, &task.id).await;

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Started);
        assert_eq!(first.task_id, task.id);
        let second = events.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::Succeeded);
    }

    #[tokio::test]
    async fn test_add_task_rejects_dependency_cycle() {
        let engine = test_engine(4, 3600);

        let mut a = Task::interval("a", "true", 60);
        a.id = "task-a".into();
        a.dependencies = vec!["task-b".into()];
        engine.add_task(a).unwrap();

        let mut b = Task::interval("b", "true", 60);
        b.id = "task-b".into();
        b.dependencies = vec!["task-a".into()];
        let err = engine.add_task(b).unwrap_err();
        assert!(err.to_string().contains("task-a"));
    }

    #[tokio::test]
    async fn test_failed_start_still_finalizes_execution() {
        let engine = test_engine(4, 3600);
        let store = engine.store();
        let task = due_task(&store, "wedged", "echo hi");

        // An execution already past Pending makes the Running write fail.
        let execution = store.create_execution(&task.id).unwrap();
        store
            .transition(&execution.id, ExecutionStatus::Running, Default::default())
            .unwrap();

        let guard = match engine.registry.admit(&task.id) {
            Admission::Admitted(guard) => guard,
            _ => panic!("expected admission"),
        };
        let mut events = engine.events().subscribe();
        engine.run_execution(task, execution.clone(), guard).await;

        // Not stranded: terminal status written and a Failed event emitted.
        let stored = store.get_execution(&execution.id).unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert!(stored.error.unwrap().contains("Could not start"));
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Failed);
    }

    #[tokio::test]
    async fn test_wait_tracking_cleared_on_disable_and_edit() {
        let engine = test_engine(4, 3600);
        let store = engine.store();

        let mut dep = due_task(&store, "upstream", "true");
        dep.next_run_at = Some(Utc::now() + chrono::Duration::seconds(3600));
        store.update_schedule_state(&dep).unwrap();

        let mut waiter = due_task(&store, "waiter", "echo later");
        waiter.dependencies = vec![dep.id.clone()];
        store.upsert_task(&waiter).unwrap();

        let stats = engine.tick(Utc::now());
        assert_eq!(stats.waiting, 1);
        assert!(engine.waiting_since.lock().unwrap().contains_key(&waiter.id));

        engine.set_enabled(&waiter.id, false).unwrap();
        assert!(engine.waiting_since.lock().unwrap().is_empty());

        // Re-registering a waiting task also resets its accumulated wait.
        let mut waiter = store.get_task(&waiter.id).unwrap().unwrap();
        waiter.enabled = true;
        waiter.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
        store.upsert_task(&waiter).unwrap();
        engine.tick(Utc::now());
        assert!(engine.waiting_since.lock().unwrap().contains_key(&waiter.id));
        engine.add_task(waiter).unwrap();
        assert!(engine.waiting_since.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_executions() {
        let engine = test_engine(4, 3600);
        let store = engine.store();
        let task = due_task(&store, "stuck", "sleep 30");

        engine.tick(Utc::now());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.active_executions(), 1);

        engine.shutdown().await;
        let status = store.latest_status(&task.id).unwrap().unwrap();
        assert_eq!(status, ExecutionStatus::Cancelled);
    }
}
