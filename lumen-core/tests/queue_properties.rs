//! Ordering properties of the task queue.

use std::time::Instant;

use lumen_core::config::{PriorityMode, QueueConfig};
use lumen_core::scheduler::TaskQueue;
use lumen_core::{Priority, Task, TaskInput};
use proptest::prelude::*;

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Critical),
    ]
}

fn task(priority: Priority) -> Task {
    Task::new("tagging", "m", TaskInput::new(serde_json::json!(null), "image/jpeg")).with_priority(priority)
}

proptest! {
    #[test]
    fn strict_mode_pops_by_priority_then_submission(priorities in prop::collection::vec(priority(), 1..40)) {
        let config = QueueConfig { fair_share_enabled: false, ..QueueConfig::default() };
        let now = Instant::now();
        let mut queue = TaskQueue::new();
        let tasks: Vec<Task> = priorities.iter().map(|p| task(*p)).collect();
        for t in &tasks {
            queue.push_at(t, usize::MAX, now).unwrap();
        }

        let mut popped = Vec::new();
        while let Some(entry) = queue.pop_at(now, &config, PriorityMode::Strict) {
            let index = tasks.iter().position(|t| t.id == entry.task_id).unwrap();
            popped.push((entry.priority.weight(), index));
        }

        prop_assert_eq!(popped.len(), tasks.len());
        for pair in popped.windows(2) {
            let ((w1, i1), (w2, i2)) = (pair[0], pair[1]);
            prop_assert!(w1 > w2 || (w1 == w2 && i1 < i2));
        }
    }

    #[test]
    fn fifo_mode_preserves_submission_order(priorities in prop::collection::vec(priority(), 1..40)) {
        let config = QueueConfig::default();
        let mut queue = TaskQueue::new();
        let tasks: Vec<Task> = priorities.iter().map(|p| task(*p)).collect();
        for t in &tasks {
            queue.push(t, usize::MAX).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop(&config, PriorityMode::Fifo))
            .map(|e| e.task_id)
            .collect();
        let expected: Vec<_> = tasks.iter().map(|t| t.id).collect();
        prop_assert_eq!(order, expected);
    }

    #[test]
    fn capacity_is_never_exceeded(capacity in 1usize..20, submissions in 0usize..40) {
        let mut queue = TaskQueue::new();
        let mut accepted = 0;
        for _ in 0..submissions {
            if queue.push(&task(Priority::Normal), capacity).is_ok() {
                accepted += 1;
            }
        }
        prop_assert_eq!(accepted, submissions.min(capacity));
        prop_assert!(queue.len() <= capacity);
    }
}
