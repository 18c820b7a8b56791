//! Scheduler bookkeeping for submitted tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceOutput;
use crate::types::{Task, TaskId};

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Final outcome of a task, available once it is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<InferenceOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub execution_ms: f64,
}

/// A task plus everything the scheduler tracks about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task: Task,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Incremented on every dispatch; results from older attempts are ignored.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl TaskRecord {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            status: TaskStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            attempt: 0,
            backend: None,
            error: None,
            result: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the record as running and start a new attempt.
    pub fn start(&mut self) -> u32 {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempt += 1;
        self.attempt
    }

    /// Move to a terminal status and build the result.
    pub fn finish(
        &mut self,
        status: TaskStatus,
        output: Option<InferenceOutput>,
        error: Option<String>,
        attempts: u32,
    ) {
        let now = Utc::now();
        let execution_ms = self
            .started_at
            .map(|s| (now - s).num_microseconds().unwrap_or(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        self.status = status;
        self.completed_at = Some(now);
        self.error = error.clone();
        self.result = Some(TaskResult {
            task_id: self.task.id,
            status,
            backend: self.backend.clone(),
            output,
            error,
            attempts,
            execution_ms,
        });
    }

    /// Milliseconds between submission and the most recent dispatch.
    pub fn wait_ms(&self) -> Option<f64> {
        self.started_at
            .map(|s| (s - self.submitted_at).num_microseconds().unwrap_or(0) as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskInput;

    fn record() -> TaskRecord {
        TaskRecord::new(Task::new(
            "ocr",
            "m",
            TaskInput::new(serde_json::json!(null), "text"),
        ))
    }

    #[test]
    fn test_lifecycle() {
        let mut r = record();
        assert_eq!(r.status, TaskStatus::Queued);
        assert!(!r.is_finished());
        assert_eq!(r.start(), 1);
        assert_eq!(r.status, TaskStatus::Running);
        assert!(r.wait_ms().unwrap() >= 0.0);

        r.finish(TaskStatus::Failed, None, Some("boom".into()), 1);
        assert!(r.is_finished());
        let result = r.result.clone().unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(r.completed_at.is_some());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::TimedOut.is_terminal());
        assert_eq!(TaskStatus::TimedOut.to_string(), "timed_out");
    }
}
