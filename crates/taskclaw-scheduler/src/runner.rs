//! Execution runner — spawns task commands, enforces timeouts, retries.
//!
//! Each attempt runs `sh -c <command>` in its own process group so a timeout
//! can kill the whole tree, not just the shell. Captured output is capped per
//! stream; the remainder is drained and discarded so a chatty child never
//! blocks on a full pipe or exhausts memory.
//!
//! The runner is pure with respect to persistence and events — the engine
//! records transitions and emits events around it.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::tasks::{ExecutionStatus, Task};

/// Runner tuning, from `[execution]` config.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-stream capture cap in bytes.
    pub output_cap_bytes: usize,
    /// Delay between retry attempts. Zero retries immediately.
    pub retry_delay: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_cap_bytes: 100 * 1024,
            retry_delay: Duration::ZERO,
        }
    }
}

/// Result of running one due-occurrence (all attempts included).
/// The final attempt's output is the recorded outcome; intermediate attempt
/// output is discarded.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Completed, Failed, or TimedOut.
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    /// Total attempts performed (1 initial + retries).
    pub attempts: u32,
    pub duration_secs: i64,
}

/// Outcome of a single subprocess attempt.
struct AttemptResult {
    status: ExecutionStatus,
    exit_code: Option<i32>,
    stdout: Option<String>,
    stderr: Option<String>,
    error: Option<String>,
}

impl AttemptResult {
    fn spawn_failed(error: String) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: Some(error),
        }
    }
}

/// Spawns and supervises task subprocesses.
pub struct ExecutionRunner {
    config: RunnerConfig,
}

impl ExecutionRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run a task's command with retry. Total attempts = max_retries + 1.
    /// Spawn failures (command not found, permission denied) retry like a
    /// non-zero exit.
    pub async fn run(&self, task: &Task) -> RunOutcome {
        let timeout = Duration::from_secs(task.timeout_secs.max(1));
        let total_attempts = task.max_retries + 1;
        let started = Instant::now();

        let mut attempt = 1;
        let mut last = self.attempt(&task.command, timeout).await;

        while last.status != ExecutionStatus::Completed && attempt < total_attempts {
            tracing::warn!(
                "🔁 Task '{}' attempt {}/{} ended {}: retrying",
                task.name,
                attempt,
                total_attempts,
                last.status
            );
            if !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            attempt += 1;
            last = self.attempt(&task.command, timeout).await;
        }

        RunOutcome {
            status: last.status,
            exit_code: last.exit_code,
            stdout: last.stdout,
            stderr: last.stderr,
            error: last.error,
            attempts: attempt,
            duration_secs: started.elapsed().as_secs() as i64,
        }
    }

    /// One subprocess attempt: spawn, capture, race against the timeout.
    async fn attempt(&self, command: &str, timeout: Duration) -> AttemptResult {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return AttemptResult::spawn_failed(format!("Spawn failed: {e}")),
        };
        let pid = child.id();

        let cap = self.config.output_cap_bytes;
        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), cap));

        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(timeout) => None,
        };

        match wait_result {
            Some(Ok(status)) => {
                let stdout = stdout_task.await.ok().flatten();
                let stderr = stderr_task.await.ok().flatten();
                if status.success() {
                    AttemptResult {
                        status: ExecutionStatus::Completed,
                        exit_code: status.code(),
                        stdout,
                        stderr,
                        error: None,
                    }
                } else {
                    let error = match status.code() {
                        Some(code) => format!("Exit code: {code}"),
                        None => "Killed by signal".to_string(),
                    };
                    AttemptResult {
                        status: ExecutionStatus::Failed,
                        exit_code: status.code(),
                        stdout,
                        stderr,
                        error: Some(error),
                    }
                }
            }
            Some(Err(e)) => {
                kill_process_group(pid);
                AttemptResult::spawn_failed(format!("Wait failed: {e}"))
            }
            None => {
                // Timer fired first: kill the whole process group so no
                // grandchildren survive, then reap.
                kill_process_group(pid);
                let _ = child.kill().await;
                let _ = child.wait().await;
                let stdout = stdout_task.await.ok().flatten();
                let stderr = stderr_task.await.ok().flatten();
                AttemptResult {
                    status: ExecutionStatus::TimedOut,
                    exit_code: None,
                    stdout,
                    stderr,
                    error: Some(format!("Timed out after {}s", timeout.as_secs())),
                }
            }
        }
    }
}

/// Read a child stream up to `cap` bytes, then drain and discard the rest.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> Option<String> {
    let mut reader = reader?;
    let mut buf = Vec::new();
    let mut limited = (&mut reader).take(cap as u64);
    let _ = limited.read_to_end(&mut buf).await;

    // Keep the pipe flowing so the child never blocks on a full buffer.
    let mut truncated = false;
    if let Ok(n) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
        truncated = n > 0;
    }

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str("\n... (truncated)");
    }
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let pgid = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            tracing::warn!("⚠️ killpg({pgid}) failed: {e}");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
