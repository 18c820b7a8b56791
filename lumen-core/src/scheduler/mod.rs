//! Task scheduling: queueing, dispatch, retries and auto-scaling.

pub mod autoscale;
pub mod engine;
pub mod metrics;
pub mod queue;
pub mod task;

pub use autoscale::{ScalingAction, ScalingDecision, ScalingInputs, ScalingMetric, ScalingTrigger};
pub use engine::TaskScheduler;
pub use metrics::{SchedulerCounters, SchedulerMetrics};
pub use queue::{QueueEntry, TaskQueue};
pub use task::{TaskRecord, TaskResult, TaskStatus};
