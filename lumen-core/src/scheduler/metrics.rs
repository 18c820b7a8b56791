//! Scheduler counters and their serializable snapshot.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::autoscale::ScalingDecision;

#[derive(Debug)]
pub struct SchedulerCounters {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub timed_out_tasks: u64,
    pub retried_tasks: u64,
    total_wait_ms: f64,
    dispatches: u64,
    total_execution_ms: f64,
    executions: u64,
    pub last_scaling_decision: Option<ScalingDecision>,
    start_time: Instant,
}

impl Default for SchedulerCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerCounters {
    pub fn new() -> Self {
        Self {
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            timed_out_tasks: 0,
            retried_tasks: 0,
            total_wait_ms: 0.0,
            dispatches: 0,
            total_execution_ms: 0.0,
            executions: 0,
            last_scaling_decision: None,
            start_time: Instant::now(),
        }
    }

    pub fn record_dispatch(&mut self, wait_ms: f64) {
        self.dispatches += 1;
        self.total_wait_ms += wait_ms;
    }

    pub fn record_execution(&mut self, execution_ms: f64) {
        self.executions += 1;
        self.total_execution_ms += execution_ms;
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self, queue_length: usize, running_tasks: usize) -> SchedulerMetrics {
        let avg = |total: f64, n: u64| if n == 0 { 0.0 } else { total / n as f64 };
        SchedulerMetrics {
            total_tasks: self.total_tasks,
            completed_tasks: self.completed_tasks,
            failed_tasks: self.failed_tasks,
            cancelled_tasks: self.cancelled_tasks,
            timed_out_tasks: self.timed_out_tasks,
            retried_tasks: self.retried_tasks,
            queue_length,
            running_tasks,
            average_wait_ms: avg(self.total_wait_ms, self.dispatches),
            average_execution_ms: avg(self.total_execution_ms, self.executions),
            last_scaling_decision: self.last_scaling_decision.clone(),
            uptime_secs: self.uptime_secs(),
        }
    }
}

/// Point-in-time scheduler metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetrics {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub timed_out_tasks: u64,
    pub retried_tasks: u64,
    pub queue_length: usize,
    pub running_tasks: usize,
    pub average_wait_ms: f64,
    pub average_execution_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scaling_decision: Option<ScalingDecision>,
    pub uptime_secs: u64,
}

impl SchedulerMetrics {
    /// Tasks that reached any terminal state.
    pub fn finished_tasks(&self) -> u64 {
        self.completed_tasks + self.failed_tasks + self.cancelled_tasks + self.timed_out_tasks
    }
}
