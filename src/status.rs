// =============================================================================
// Task Status Registry — structured state for the runtime control surface
// =============================================================================
//
// Every long-lived task registers here and reports events, errors, and
// backlog. The loopback API serves the snapshot so an operator can see
// {state, last_event_time, error_rate, backlog} per task.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Coarse lifecycle state of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Starting,
    Running,
    Degraded,
    Stopped,
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Degraded => write!(f, "degraded"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
struct TaskEntry {
    state: TaskState,
    last_event_time: Option<DateTime<Utc>>,
    events: u64,
    errors: u64,
    backlog: u64,
}

impl TaskEntry {
    fn new() -> Self {
        Self {
            state: TaskState::Starting,
            last_event_time: None,
            events: 0,
            errors: 0,
            backlog: 0,
        }
    }
}

/// Serializable per-task status for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub name: String,
    pub state: TaskState,
    pub last_event_time: Option<DateTime<Utc>>,
    pub events: u64,
    pub errors: u64,
    /// errors / max(events, 1)
    pub error_rate: f64,
    pub backlog: u64,
}

/// Shared registry of all task statuses. Cheap to clone behind `Arc`.
pub struct StatusRegistry {
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    fn with_entry(&self, name: &str, f: impl FnOnce(&mut TaskEntry)) {
        let mut tasks = self.tasks.write();
        f(tasks.entry(name.to_string()).or_insert_with(TaskEntry::new));
    }

    pub fn set_state(&self, name: &str, state: TaskState) {
        if state == TaskState::Failed {
            warn!(task = name, "task entered failed state");
        }
        self.with_entry(name, |e| e.state = state);
    }

    /// Record one successfully processed event.
    pub fn record_event(&self, name: &str) {
        self.with_entry(name, |e| {
            e.events += 1;
            e.last_event_time = Some(Utc::now());
        });
    }

    /// Record one dropped/failed message.
    pub fn record_error(&self, name: &str) {
        self.with_entry(name, |e| e.errors += 1);
    }

    pub fn set_backlog(&self, name: &str, backlog: u64) {
        self.with_entry(name, |e| e.backlog = backlog);
    }

    pub fn get(&self, name: &str) -> Option<TaskStatus> {
        let tasks = self.tasks.read();
        tasks.get(name).map(|e| to_status(name, e))
    }

    /// Full snapshot, sorted by task name.
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let tasks = self.tasks.read();
        let mut out: Vec<TaskStatus> = tasks.iter().map(|(name, e)| to_status(name, e)).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn to_status(name: &str, e: &TaskEntry) -> TaskStatus {
    TaskStatus {
        name: name.to_string(),
        state: e.state,
        last_event_time: e.last_event_time,
        events: e.events,
        errors: e.errors,
        error_rate: e.errors as f64 / e.events.max(1) as f64,
        backlog: e.backlog,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_and_error_rate() {
        let registry = StatusRegistry::new();
        registry.set_state("spot_ingestor", TaskState::Running);
        for _ in 0..8 {
            registry.record_event("spot_ingestor");
        }
        registry.record_error("spot_ingestor");
        registry.record_error("spot_ingestor");
        registry.set_backlog("spot_ingestor", 42);

        let status = registry.get("spot_ingestor").unwrap();
        assert_eq!(status.state, TaskState::Running);
        assert_eq!(status.events, 8);
        assert_eq!(status.errors, 2);
        assert!((status.error_rate - 0.25).abs() < 1e-9);
        assert_eq!(status.backlog, 42);
        assert!(status.last_event_time.is_some());
    }

    #[test]
    fn snapshot_is_sorted_and_complete() {
        let registry = StatusRegistry::new();
        registry.set_state("zeta", TaskState::Running);
        registry.set_state("alpha", TaskState::Stopped);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "alpha");
        assert_eq!(snapshot[1].name, "zeta");
    }

    #[test]
    fn unknown_task_is_none() {
        let registry = StatusRegistry::new();
        assert!(registry.get("ghost").is_none());
    }
}
