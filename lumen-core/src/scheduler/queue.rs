//! Priority queue with aging and fair-share dispatch.

use std::time::Instant;

use crate::config::{PriorityMode, QueueConfig};
use crate::error::SchedulerError;
use crate::types::{Priority, Task, TaskId};

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub task_type: String,
    pub submitter: Option<String>,
    pub priority: Priority,
    pub seq: u64,
    pub enqueued_at: Instant,
}

impl QueueEntry {
    /// Priority used for ordering, including the aging boost.
    pub fn effective_priority(&self, now: Instant, config: &QueueConfig, mode: PriorityMode) -> u64 {
        match mode {
            PriorityMode::Fifo => 0,
            PriorityMode::Strict => u64::from(self.priority.weight()),
            PriorityMode::Weighted => {
                let base = u64::from(self.priority.weight());
                if !config.priority_aging_enabled || config.aging_interval_ms == 0 {
                    return base;
                }
                let waited = now.saturating_duration_since(self.enqueued_at).as_millis() as u64;
                base + waited / config.aging_interval_ms
            }
        }
    }
}

#[derive(Debug, Default)]
struct Streak {
    key: Option<String>,
    count: u32,
}

impl Streak {
    fn blocks(&self, key: Option<&str>, limit: u32) -> bool {
        key.is_some() && self.key.as_deref() == key && self.count >= limit
    }

    fn advance(&mut self, key: Option<&str>) {
        if key.is_some() && self.key.as_deref() == key {
            self.count += 1;
        } else {
            self.key = key.map(str::to_string);
            self.count = 1;
        }
    }
}

/// Pending tasks awaiting dispatch.
#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: Vec<QueueEntry>,
    next_seq: u64,
    type_streak: Streak,
    submitter_streak: Streak,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.entries.iter().any(|e| e.task_id == task_id)
    }

    /// Enqueue a task, rejecting it once `capacity` entries are waiting.
    pub fn push(&mut self, task: &Task, capacity: usize) -> Result<(), SchedulerError> {
        self.push_at(task, capacity, Instant::now())
    }

    pub fn push_at(&mut self, task: &Task, capacity: usize, now: Instant) -> Result<(), SchedulerError> {
        if self.entries.len() >= capacity {
            return Err(SchedulerError::QueueFull { max: capacity });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueueEntry {
            task_id: task.id,
            task_type: task.task_type.clone(),
            submitter: task.submitter.clone(),
            priority: task.priority,
            seq,
            enqueued_at: now,
        });
        Ok(())
    }

    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.task_id != task_id);
        self.entries.len() != before
    }

    /// Remove every entry, returning their ids in queue order.
    pub fn drain(&mut self) -> Vec<TaskId> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.task_id).collect()
    }

    /// Ids ordered by dispatch preference at `now`, ignoring fair share.
    pub fn ranked(&self, now: Instant, config: &QueueConfig, mode: PriorityMode) -> Vec<TaskId> {
        self.ranked_indices(now, config, mode)
            .into_iter()
            .map(|i| self.entries[i].task_id)
            .collect()
    }

    fn ranked_indices(&self, now: Instant, config: &QueueConfig, mode: PriorityMode) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.entries.len()).collect();
        indices.sort_by(|&a, &b| {
            let (ea, eb) = (&self.entries[a], &self.entries[b]);
            eb.effective_priority(now, config, mode)
                .cmp(&ea.effective_priority(now, config, mode))
                .then(ea.seq.cmp(&eb.seq))
        });
        indices
    }

    pub fn pop(&mut self, config: &QueueConfig, mode: PriorityMode) -> Option<QueueEntry> {
        self.pop_at(Instant::now(), config, mode)
    }

    /// Take the next entry to dispatch. With fair share enabled, an entry that
    /// would extend a task-type or submitter streak past the limit is skipped
    /// in favour of the next candidate, if there is one.
    pub fn pop_at(&mut self, now: Instant, config: &QueueConfig, mode: PriorityMode) -> Option<QueueEntry> {
        let ranked = self.ranked_indices(now, config, mode);
        let first = *ranked.first()?;

        let chosen = if config.fair_share_enabled {
            let limit = config.max_consecutive_dispatches;
            ranked
                .iter()
                .copied()
                .find(|&i| {
                    let e = &self.entries[i];
                    !self.type_streak.blocks(Some(&e.task_type), limit)
                        && !self.submitter_streak.blocks(e.submitter.as_deref(), limit)
                })
                .unwrap_or(first)
        } else {
            first
        };

        let entry = self.entries.remove(chosen);
        self.type_streak.advance(Some(&entry.task_type));
        self.submitter_streak.advance(entry.submitter.as_deref());
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskInput;
    use std::time::Duration;

    fn task(task_type: &str, priority: Priority) -> Task {
        Task::new(task_type, "m", TaskInput::new(serde_json::json!(null), "x")).with_priority(priority)
    }

    fn no_fair_share() -> QueueConfig {
        QueueConfig {
            fair_share_enabled: false,
            ..QueueConfig::default()
        }
    }

    #[test]
    fn test_capacity() {
        let mut q = TaskQueue::new();
        q.push(&task("a", Priority::Normal), 1).unwrap();
        assert!(matches!(
            q.push(&task("a", Priority::Normal), 1),
            Err(SchedulerError::QueueFull { max: 1 })
        ));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_priority_then_fifo() {
        let cfg = no_fair_share();
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let low = task("a", Priority::Low);
        let high1 = task("a", Priority::High);
        let high2 = task("a", Priority::High);
        for t in [&low, &high1, &high2] {
            q.push_at(t, 10, now).unwrap();
        }
        let order: Vec<TaskId> = std::iter::from_fn(|| q.pop_at(now, &cfg, PriorityMode::Weighted))
            .map(|e| e.task_id)
            .collect();
        assert_eq!(order, vec![high1.id, high2.id, low.id]);
    }

    #[test]
    fn test_fifo_mode_ignores_priority() {
        let cfg = no_fair_share();
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let low = task("a", Priority::Low);
        let critical = task("a", Priority::Critical);
        q.push_at(&low, 10, now).unwrap();
        q.push_at(&critical, 10, now).unwrap();
        assert_eq!(q.pop_at(now, &cfg, PriorityMode::Fifo).unwrap().task_id, low.id);
    }

    #[test]
    fn test_aging_promotes_old_tasks() {
        let cfg = QueueConfig {
            aging_interval_ms: 100,
            ..no_fair_share()
        };
        let start = Instant::now();
        let mut q = TaskQueue::new();
        let old_low = task("a", Priority::Low);
        q.push_at(&old_low, 10, start).unwrap();
        let later = start + Duration::from_millis(500);
        let fresh_high = task("a", Priority::High);
        q.push_at(&fresh_high, 10, later).unwrap();

        // Low (1) + 5 intervals beats High (3) under weighted aging...
        assert_eq!(q.ranked(later, &cfg, PriorityMode::Weighted)[0], old_low.id);
        // ...but never under strict priority.
        assert_eq!(q.ranked(later, &cfg, PriorityMode::Strict)[0], fresh_high.id);
    }

    #[test]
    fn test_fair_share_limits_streaks() {
        let cfg = QueueConfig {
            fair_share_enabled: true,
            max_consecutive_dispatches: 2,
            ..QueueConfig::default()
        };
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let faces: Vec<Task> = (0..4).map(|_| task("faces", Priority::High)).collect();
        let ocr = task("ocr", Priority::Low);
        for t in &faces {
            q.push_at(t, 10, now).unwrap();
        }
        q.push_at(&ocr, 10, now).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.pop_at(now, &cfg, PriorityMode::Strict))
            .map(|e| e.task_type)
            .collect();
        assert_eq!(order, vec!["faces", "faces", "ocr", "faces", "faces"]);
    }

    #[test]
    fn test_fair_share_by_submitter() {
        let cfg = QueueConfig {
            fair_share_enabled: true,
            max_consecutive_dispatches: 1,
            ..QueueConfig::default()
        };
        let now = Instant::now();
        let mut q = TaskQueue::new();
        let a1 = task("x", Priority::Normal).with_submitter("alice");
        let a2 = task("y", Priority::Normal).with_submitter("alice");
        let b1 = task("z", Priority::Normal).with_submitter("bob");
        for t in [&a1, &a2, &b1] {
            q.push_at(t, 10, now).unwrap();
        }
        let order: Vec<TaskId> = std::iter::from_fn(|| q.pop_at(now, &cfg, PriorityMode::Weighted))
            .map(|e| e.task_id)
            .collect();
        assert_eq!(order, vec![a1.id, b1.id, a2.id]);
    }

    #[test]
    fn test_remove_and_drain() {
        let mut q = TaskQueue::new();
        let a = task("a", Priority::Normal);
        let b = task("b", Priority::Normal);
        q.push(&a, 10).unwrap();
        q.push(&b, 10).unwrap();
        assert!(q.remove(a.id));
        assert!(!q.remove(a.id));
        assert!(q.contains(b.id));
        assert_eq!(q.drain(), vec![b.id]);
        assert!(q.is_empty());
    }
}
