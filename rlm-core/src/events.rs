//! Verbosity-filtered event bus and the append-only task queue presented to
//! observers of a running experiment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// The kind of thing that happened during an experiment. Each kind has a
/// minimum verbosity level below which it is not delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Error,
    IterationComplete,
    TaskUpdate,
    LlmRequest,
    LlmResponse,
    LlmError,
    StrategySelection,
    MutationStart,
    MutationEnd,
    JudgeStart,
    JudgeEnd,
    DecisionPoint,
}

impl EventKind {
    /// Verbosity level (0-3) at or above which this event kind is delivered.
    pub fn min_verbosity(self) -> u8 {
        match self {
            EventKind::Error => 0,
            EventKind::IterationComplete => 1,
            EventKind::TaskUpdate => 1,
            EventKind::LlmRequest | EventKind::LlmResponse | EventKind::LlmError => 2,
            EventKind::StrategySelection => 3,
            EventKind::MutationStart | EventKind::MutationEnd => 3,
            EventKind::JudgeStart | EventKind::JudgeEnd => 3,
            EventKind::DecisionPoint => 3,
        }
    }
}

/// A single event emitted while running an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl ExperimentEvent {
    pub fn new(experiment_id: impl Into<String>, kind: EventKind, payload: Value) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

const CHANNEL_CAPACITY: usize = 1024;

/// Per-experiment pub/sub channel, filtered by subscriber-chosen verbosity.
///
/// Subscribers that lag behind the broadcast capacity silently miss events
/// rather than block publishers; this mirrors the "best effort live view"
/// nature of the external dashboard this bus feeds.
pub struct EventBus {
    sender: broadcast::Sender<ExperimentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. No-op (but not an error) if there are no subscribers.
    pub fn publish(&self, event: ExperimentEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe at the given verbosity (0-3, clamped). The returned handle
    /// only yields events whose kind's `min_verbosity()` is <= `verbosity`.
    pub fn subscribe(&self, verbosity: u8) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            verbosity: verbosity.min(3),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventSubscription {
    receiver: broadcast::Receiver<ExperimentEvent>,
    verbosity: u8,
}

impl EventSubscription {
    /// Set the verbosity filter applied to subsequently received events,
    /// mirroring the `set_verbosity` control message external observers send.
    pub fn set_verbosity(&mut self, verbosity: u8) {
        self.verbosity = verbosity.min(3);
    }

    /// Await the next event that passes this subscription's verbosity filter.
    /// Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<ExperimentEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.kind.min_verbosity() <= self.verbosity {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A single task in the presentational task queue. Dependency edges are
/// metadata only; they do not gate execution order in the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub label: String,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// Append-only queue of presentational tasks for one experiment's live view.
pub struct TaskQueue {
    tasks: Vec<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, label: impl Into<String>, depends_on: Vec<String>) -> String {
        let id = format!("task-{}", self.tasks.len() + 1);
        self.tasks.push(Task {
            id: id.clone(),
            label: label.into(),
            depends_on,
            status: TaskStatus::Pending,
        });
        id
    }

    pub fn set_status(&mut self, id: &str, status: TaskStatus) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) {
            task.status = status;
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_only_sees_events_at_or_below_its_verbosity() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(1);

        bus.publish(ExperimentEvent::new("exp-1", EventKind::LlmRequest, json!({})));
        bus.publish(ExperimentEvent::new(
            "exp-1",
            EventKind::IterationComplete,
            json!({"n": 1}),
        ));

        let received = sub.recv().await.expect("event");
        assert_eq!(received.kind, EventKind::IterationComplete);
    }

    #[tokio::test]
    async fn raising_verbosity_mid_stream_admits_finer_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(0);
        sub.set_verbosity(3);

        bus.publish(ExperimentEvent::new("exp-1", EventKind::LlmRequest, json!({})));
        let received = sub.recv().await.expect("event");
        assert_eq!(received.kind, EventKind::LlmRequest);
    }

    #[test]
    fn task_queue_assigns_sequential_ids() {
        let mut queue = TaskQueue::new();
        let a = queue.push("mutate seed 1", vec![]);
        let b = queue.push("target call", vec![a.clone()]);
        assert_eq!(a, "task-1");
        assert_eq!(b, "task-2");
        assert_eq!(queue.tasks()[1].depends_on, vec!["task-1".to_string()]);
    }
}
