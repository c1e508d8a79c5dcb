//! Dependency gate — decides whether a task's dependencies permit it to run.
//!
//! The check is a shallow, non-transitive "all direct dependencies succeeded"
//! gate over point-in-time status reads; it is not a workflow DAG executor.
//! Cycles are rejected at definition time by [`check_cycles`].

use std::collections::{HashMap, HashSet};

use taskclaw_core::error::{Result, TaskClawError};

use crate::tasks::{ExecutionStatus, Task};

/// What the latest execution of a dependency looks like to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepState {
    /// The dependency id does not exist in the system.
    Unknown,
    /// The dependency exists but has never run.
    NeverRan,
    /// The dependency's latest execution has this status.
    Latest(ExecutionStatus),
}

/// The gate's verdict for one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// All dependencies completed — dispatch now.
    Run,
    /// At least one dependency is still pending/running or has never run.
    /// Re-evaluate next tick; the due occurrence is preserved.
    Wait(String),
    /// At least one dependency ended unsuccessfully. The occurrence is
    /// recorded as SKIPPED and not retried.
    Skip(String),
    /// A dependency id is unknown — an operator-visible failure.
    Fail(String),
}

impl GateDecision {
    /// Worst-case-wins combination order: Fail > Skip > Wait > Run.
    fn severity(&self) -> u8 {
        match self {
            GateDecision::Run => 0,
            GateDecision::Wait(_) => 1,
            GateDecision::Skip(_) => 2,
            GateDecision::Fail(_) => 3,
        }
    }
}

/// Evaluate a task's dependency set against the latest-execution lookup.
/// An empty dependency set always gates to Run.
pub fn evaluate<F>(task: &Task, lookup: F) -> GateDecision
where
    F: Fn(&str) -> DepState,
{
    let mut decision = GateDecision::Run;

    for dep_id in &task.dependencies {
        let contribution = match lookup(dep_id) {
            DepState::Unknown => {
                GateDecision::Fail(TaskClawError::DependencyNotFound(dep_id.clone()).to_string())
            }
            DepState::NeverRan => {
                GateDecision::Wait(format!("Dependency {dep_id} has never run"))
            }
            DepState::Latest(status) => match status {
                ExecutionStatus::Pending | ExecutionStatus::Running => {
                    GateDecision::Wait(format!("Dependency {dep_id} is {status}"))
                }
                ExecutionStatus::Completed => GateDecision::Run,
                ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled => {
                    GateDecision::Skip(format!("Dependency {dep_id} ended {status}"))
                }
                // Skipped dependencies did not succeed either.
                ExecutionStatus::Skipped => {
                    GateDecision::Skip(format!("Dependency {dep_id} was skipped"))
                }
            },
        };

        if contribution.severity() > decision.severity() {
            decision = contribution;
        }
    }

    decision
}

/// Reject dependency graphs containing a cycle. Intended for the task
/// definition path (create/edit), before a task set reaches the scheduler —
/// a cycle would otherwise manifest as permanent WAIT and starve.
///
/// Unknown dependency ids are not treated as cycle errors here; the gate
/// surfaces those as FAIL at dispatch time.
pub fn check_cycles(tasks: &[Task]) -> Result<()> {
    let deps: HashMap<&str, &Vec<String>> = tasks
        .iter()
        .map(|t| (t.id.as_str(), &t.dependencies))
        .collect();

    let mut done: HashSet<&str> = HashSet::new();

    for task in tasks {
        if done.contains(task.id.as_str()) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        walk(task.id.as_str(), &deps, &mut path, &mut on_path, &mut done)?;
    }
    Ok(())
}

fn walk<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, &'a Vec<String>>,
    path: &mut Vec<&'a str>,
    on_path: &mut HashSet<&'a str>,
    done: &mut HashSet<&'a str>,
) -> Result<()> {
    if done.contains(id) {
        return Ok(());
    }
    if !on_path.insert(id) {
        let start = path.iter().position(|p| *p == id).unwrap_or(0);
        let cycle = path[start..].join(" -> ");
        return Err(TaskClawError::DependencyCycle(format!("{cycle} -> {id}")));
    }
    path.push(id);

    if let Some(children) = deps.get(id) {
        for child in children.iter() {
            if deps.contains_key(child.as_str()) {
                walk(child.as_str(), deps, path, on_path, done)?;
            }
        }
    }

    path.pop();
    on_path.remove(id);
    done.insert(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::Task;

    fn task_with_deps(id: &str, deps: &[&str]) -> Task {
        let mut task = Task::interval(id, "true", 60);
        task.id = id.to_string();
        task.dependencies = deps.iter().map(|d| d.to_string()).collect();
        task
    }

    #[test]
    fn test_empty_deps_always_run() {
        let task = task_with_deps("a", &[]);
        let decision = evaluate(&task, |_| DepState::Unknown);
        assert_eq!(decision, GateDecision::Run);
    }

    #[test]
    fn test_completed_dep_runs() {
        let task = task_with_deps("a", &["b"]);
        let decision = evaluate(&task, |_| DepState::Latest(ExecutionStatus::Completed));
        assert_eq!(decision, GateDecision::Run);
    }

    #[test]
    fn test_never_ran_waits() {
        let task = task_with_deps("a", &["c"]);
        assert!(matches!(
            evaluate(&task, |_| DepState::NeverRan),
            GateDecision::Wait(_)
        ));
    }

    #[test]
    fn test_running_dep_waits() {
        let task = task_with_deps("a", &["b"]);
        assert!(matches!(
            evaluate(&task, |_| DepState::Latest(ExecutionStatus::Running)),
            GateDecision::Wait(_)
        ));
    }

    #[test]
    fn test_failed_dep_skips() {
        let task = task_with_deps("a", &["b"]);
        for status in [
            ExecutionStatus::Failed,
            ExecutionStatus::TimedOut,
            ExecutionStatus::Cancelled,
        ] {
            assert!(matches!(
                evaluate(&task, |_| DepState::Latest(status)),
                GateDecision::Skip(_)
            ));
        }
    }

    #[test]
    fn test_unknown_dep_fails() {
        let task = task_with_deps("a", &["ghost"]);
        assert!(matches!(
            evaluate(&task, |_| DepState::Unknown),
            GateDecision::Fail(_)
        ));
    }

    #[test]
    fn test_worst_case_wins() {
        let task = task_with_deps("a", &["ok", "waiting", "broken"]);
        let decision = evaluate(&task, |id| match id {
            "ok" => DepState::Latest(ExecutionStatus::Completed),
            "waiting" => DepState::NeverRan,
            _ => DepState::Latest(ExecutionStatus::Failed),
        });
        assert!(matches!(decision, GateDecision::Skip(_)));

        let decision = evaluate(&task, |id| match id {
            "ok" => DepState::Latest(ExecutionStatus::Failed),
            "waiting" => DepState::NeverRan,
            _ => DepState::Unknown,
        });
        assert!(matches!(decision, GateDecision::Fail(_)));
    }

    #[test]
    fn test_cycle_detection() {
        let a = task_with_deps("a", &["b"]);
        let b = task_with_deps("b", &["c"]);
        let c = task_with_deps("c", &["a"]);
        assert!(check_cycles(&[a, b, c]).is_err());
    }

    #[test]
    fn test_self_cycle() {
        let a = task_with_deps("a", &["a"]);
        assert!(check_cycles(&[a]).is_err());
    }

    #[test]
    fn test_acyclic_chain_ok() {
        let a = task_with_deps("a", &["b"]);
        let b = task_with_deps("b", &["c"]);
        let c = task_with_deps("c", &[]);
        // Diamond: d depends on a and b, both reaching c.
        let d = task_with_deps("d", &["a", "b"]);
        assert!(check_cycles(&[a, b, c, d]).is_ok());
    }

    #[test]
    fn test_unknown_ids_not_cycles() {
        let a = task_with_deps("a", &["missing"]);
        assert!(check_cycles(&[a]).is_ok());
    }
}
