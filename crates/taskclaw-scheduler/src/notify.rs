//! Lifecycle event emission — one event per execution state transition.
//!
//! Delivery is fire-and-forget: the notification collaborator subscribes and
//! filters on its side; the core never blocks on, retries, or verifies
//! delivery. A bounded in-memory history ring is kept for inspection.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Event history ring size.
const HISTORY_MAX: usize = 100;

/// Task lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Started,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Started => write!(f, "started"),
            EventKind::Succeeded => write!(f, "succeeded"),
            EventKind::Failed => write!(f, "failed"),
            EventKind::Skipped => write!(f, "skipped"),
            EventKind::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// One task lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub execution_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Short human-readable context (gate reason, error summary).
    pub detail: Option<String>,
}

impl TaskEvent {
    pub fn new(task_id: &str, execution_id: &str, kind: EventKind, detail: Option<String>) -> Self {
        Self {
            task_id: task_id.to_string(),
            execution_id: execution_id.to_string(),
            kind,
            timestamp: Utc::now(),
            detail,
        }
    }
}

/// Fans lifecycle events out to subscribers over unbounded channels.
pub struct EventRouter {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TaskEvent>>>,
    history: Mutex<Vec<TaskEvent>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Publish an event. Closed subscribers are pruned; nothing blocks.
    pub fn emit(&self, event: TaskEvent) {
        tracing::debug!(
            "📣 Event: task={} execution={} kind={}",
            event.task_id,
            event.execution_id,
            event.kind
        );

        {
            let mut history = self.history.lock().unwrap();
            history.push(event.clone());
            if history.len() > HISTORY_MAX {
                history.remove(0);
            }
        }

        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<TaskEvent> {
        self.history.lock().unwrap().clone()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_and_emit() {
        let router = EventRouter::new();
        let mut rx = router.subscribe();
        router.emit(TaskEvent::new("t1", "e1", EventKind::Started, None));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, "t1");
        assert_eq!(event.kind, EventKind::Started);
        assert_eq!(router.history().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned() {
        let router = EventRouter::new();
        let rx = router.subscribe();
        drop(rx);
        // Must not error or block with a dead subscriber.
        router.emit(TaskEvent::new("t1", "e1", EventKind::Failed, None));
        router.emit(TaskEvent::new("t1", "e2", EventKind::Skipped, None));
        assert_eq!(router.history().len(), 2);
    }

    #[test]
    fn test_history_ring_bounded() {
        let router = EventRouter::new();
        for i in 0..150 {
            router.emit(TaskEvent::new(
                "t",
                &format!("e{i}"),
                EventKind::Succeeded,
                None,
            ));
        }
        let history = router.history();
        assert_eq!(history.len(), HISTORY_MAX);
        assert_eq!(history.last().unwrap().execution_id, "e149");
    }
}
