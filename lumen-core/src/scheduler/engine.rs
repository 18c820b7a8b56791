//! Task scheduler: queueing, concurrency-bounded dispatch, timeouts,
//! retries and periodic auto-scaling evaluation.
//!
//! The scheduler is a cheap `Clone` handle around shared state. `start()`
//! spawns two loops on a `TaskTracker`: a dispatch loop woken by submissions
//! and completions (with a fallback tick so aging is re-evaluated), and an
//! auto-scaling loop on `health_check_interval`. Every running task is a
//! spawned future that races the backend call against its timeout and its
//! own cancellation token.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::autoscale::{self, ScalingDecision, ScalingInputs};
use super::metrics::{SchedulerCounters, SchedulerMetrics};
use super::queue::TaskQueue;
use super::task::{TaskRecord, TaskResult, TaskStatus};
use crate::config::{SchedulerConfig, SchedulerConfigUpdate};
use crate::error::{ConfigError, SchedulerError};
use crate::manager::{BackendManager, TaskExecutionResult};
use crate::types::{Task, TaskId};

struct RunningTask {
    attempt: u32,
    token: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    queue: TaskQueue,
    records: HashMap<TaskId, TaskRecord>,
    running: HashMap<TaskId, RunningTask>,
    counters: SchedulerCounters,
}

enum AttemptOutcome {
    Finished(TaskExecutionResult),
    TimedOut,
    Cancelled,
}

struct SchedulerInner {
    manager: Arc<BackendManager>,
    config: RwLock<SchedulerConfig>,
    state: Mutex<SchedulerState>,
    wake: Notify,
    events: watch::Sender<u64>,
    root: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    shut_down: AtomicBool,
}

/// Queues inference tasks and runs them through the backend manager.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig, manager: Arc<BackendManager>) -> Result<Self, ConfigError> {
        config.validate()?;
        manager.set_load_balancing_strategy(config.load_balancing_strategy);
        let (events, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                manager,
                config: RwLock::new(config),
                state: Mutex::new(SchedulerState::default()),
                wake: Notify::new(),
                events,
                root: CancellationToken::new(),
                tracker: TaskTracker::new(),
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.inner.manager
    }

    pub fn config(&self) -> SchedulerConfig {
        self.inner.config()
    }

    /// Spawn the dispatch and auto-scaling loops. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.shut_down.load(Ordering::SeqCst)
            || self.inner.started.swap(true, Ordering::SeqCst)
        {
            return;
        }
        let config = self.inner.config();

        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            loop {
                let tick = inner.config().dispatch_interval();
                tokio::select! {
                    _ = inner.root.cancelled() => break,
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                }
                inner.dispatch_ready();
            }
            debug!("Dispatch loop stopped");
        });

        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(config.health_check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = inner.root.cancelled() => break,
                    _ = ticker.tick() => {
                        if inner.config().auto_scaling {
                            inner.check_auto_scaling();
                        }
                    }
                }
            }
            debug!("Auto-scaling loop stopped");
        });

        info!(
            max_concurrent = config.max_concurrent_tasks,
            queue_capacity = config.effective_queue_size(),
            mode = ?config.priority_mode,
            "Task scheduler started"
        );
    }

    /// Queue a task for execution.
    pub fn submit_task(&self, task: Task) -> Result<TaskId, SchedulerError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        let capacity = self.inner.config().effective_queue_size();
        let id = task.id;
        {
            let mut state = self.inner.lock_state();
            state.queue.push(&task, capacity)?;
            debug!(task_id = %id, task_type = %task.task_type, priority = %task.priority, "Task queued");
            state.records.insert(id, TaskRecord::new(task));
            state.counters.total_tasks += 1;
        }
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Cancel a queued or running task. Returns `false` for unknown or
    /// already finished tasks.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let cancelled = {
            let mut state = self.inner.lock_state();
            let state = &mut *state;
            match state.records.get_mut(&id) {
                Some(record) if !record.is_finished() => {
                    state.queue.remove(id);
                    if let Some(running) = state.running.remove(&id) {
                        running.token.cancel();
                    }
                    let attempts = record.attempt;
                    record.finish(
                        TaskStatus::Cancelled,
                        None,
                        Some("cancelled".into()),
                        attempts,
                    );
                    state.counters.cancelled_tasks += 1;
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            info!(task_id = %id, "Task cancelled");
            self.inner.publish();
            self.inner.wake.notify_one();
        }
        cancelled
    }

    pub fn get_task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.inner.lock_state().records.get(&id).map(|r| r.status)
    }

    /// Result of a finished task. `None` while it is queued or running.
    pub fn get_task_result(&self, id: TaskId) -> Option<TaskResult> {
        self.inner
            .lock_state()
            .records
            .get(&id)
            .filter(|r| r.is_finished())
            .and_then(|r| r.result.clone())
    }

    pub fn get_task(&self, id: TaskId) -> Option<TaskRecord> {
        self.inner.lock_state().records.get(&id).cloned()
    }

    /// Tracked tasks, oldest submission first, optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .inner
            .lock_state()
            .records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.submitted_at);
        records
    }

    /// Wait until a task reaches a terminal state.
    pub async fn wait_for_task(&self, id: TaskId, timeout: Duration) -> Result<TaskResult, SchedulerError> {
        let mut events = self.inner.events.subscribe();
        let wait = async {
            loop {
                match self.get_task(id) {
                    None => return Err(SchedulerError::TaskNotFound { id: id.to_string() }),
                    Some(record) if record.is_finished() => {
                        return record.result.ok_or(SchedulerError::TaskNotFound {
                            id: id.to_string(),
                        });
                    }
                    Some(_) => {}
                }
                if events.changed().await.is_err() {
                    return Err(SchedulerError::ShutDown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SchedulerError::TaskTimeout {
                id: id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Forget finished tasks. Returns how many were removed.
    pub fn cleanup_finished(&self) -> usize {
        let mut state = self.inner.lock_state();
        let before = state.records.len();
        state.records.retain(|_, r| !r.is_finished());
        before - state.records.len()
    }

    /// Tasks currently holding a claim, per backend.
    pub fn get_backend_load_distribution(&self) -> BTreeMap<String, usize> {
        self.inner.manager.load_distribution()
    }

    /// Evaluate auto-scaling now. The decision is logged and kept in metrics.
    pub fn check_auto_scaling(&self) -> ScalingDecision {
        self.inner.check_auto_scaling()
    }

    /// Apply a partial config update. Invalid updates leave the current
    /// config untouched.
    pub fn update_config(&self, update: &SchedulerConfigUpdate) -> Result<SchedulerConfig, ConfigError> {
        let next = {
            let mut config = self
                .inner
                .config
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let next = config.merged(update);
            next.validate()?;
            *config = next;
            next
        };
        self.inner
            .manager
            .set_load_balancing_strategy(next.load_balancing_strategy);
        info!(
            max_concurrent = next.max_concurrent_tasks,
            queue_capacity = next.effective_queue_size(),
            "Scheduler configuration updated"
        );
        self.inner.wake.notify_one();
        Ok(next)
    }

    pub fn get_metrics(&self) -> SchedulerMetrics {
        let state = self.inner.lock_state();
        state
            .counters
            .snapshot(state.queue.len(), state.running.len())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the loops, cancel queued and running tasks, then shut down the
    /// backend manager.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.root.cancel();

        let cancelled = {
            let mut state = self.inner.lock_state();
            let state = &mut *state;
            let mut ids = state.queue.drain();
            ids.extend(state.running.drain().map(|(id, running)| {
                running.token.cancel();
                id
            }));
            let mut cancelled = 0u64;
            for id in ids {
                if let Some(record) = state.records.get_mut(&id) {
                    if !record.is_finished() {
                        let attempts = record.attempt;
                        record.finish(
                            TaskStatus::Cancelled,
                            None,
                            Some("scheduler shut down".into()),
                            attempts,
                        );
                        cancelled += 1;
                    }
                }
            }
            state.counters.cancelled_tasks += cancelled;
            cancelled
        };
        self.inner.publish();

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.manager.shutdown().await;
        info!(cancelled, "Task scheduler shut down");
    }
}

impl SchedulerInner {
    fn config(&self) -> SchedulerConfig {
        *self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self) {
        self.events.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
    }

    /// Move queued tasks into free slots.
    fn dispatch_ready(self: &Arc<Self>) {
        if self.root.is_cancelled() {
            return;
        }
        let config = self.config();
        let mut launches = Vec::new();
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            while state.running.len() < config.max_concurrent_tasks {
                let Some(entry) = state.queue.pop(&config.queue_config, config.priority_mode) else {
                    break;
                };
                let Some(record) = state.records.get_mut(&entry.task_id) else {
                    continue;
                };
                if record.status != TaskStatus::Queued {
                    continue;
                }
                let attempt = record.start();
                state
                    .counters
                    .record_dispatch(record.wait_ms().unwrap_or(0.0));
                let token = self.root.child_token();
                state.running.insert(
                    entry.task_id,
                    RunningTask {
                        attempt,
                        token: token.clone(),
                    },
                );
                launches.push((record.task.clone(), attempt, token));
            }
        }

        for (task, attempt, token) in launches {
            debug!(task_id = %task.id, attempt, "Dispatching task");
            let inner = self.clone();
            self.tracker.spawn(async move {
                let timeout = inner.config().task_timeout();
                let outcome = tokio::select! {
                    _ = token.cancelled() => AttemptOutcome::Cancelled,
                    result = tokio::time::timeout(timeout, inner.manager.execute_task(&task)) => {
                        match result {
                            Ok(result) => AttemptOutcome::Finished(result),
                            Err(_) => AttemptOutcome::TimedOut,
                        }
                    }
                };
                inner.complete(&task, attempt, outcome, timeout);
            });
        }
    }

    /// Record the outcome of one attempt. Outcomes from superseded attempts
    /// are discarded.
    fn complete(&self, task: &Task, attempt: u32, outcome: AttemptOutcome, timeout: Duration) {
        let config = self.config();
        let id = task.id;
        let mut terminal = false;
        {
            let mut state = self.lock_state();
            let state = &mut *state;
            let current = state
                .running
                .get(&id)
                .is_some_and(|running| running.attempt == attempt);
            let Some(record) = state.records.get_mut(&id) else {
                return;
            };
            if !current || record.status != TaskStatus::Running || record.attempt != attempt {
                debug!(task_id = %id, attempt, "Discarding stale task outcome");
                return;
            }
            state.running.remove(&id);

            match outcome {
                AttemptOutcome::Cancelled => {
                    record.finish(
                        TaskStatus::Cancelled,
                        None,
                        Some("scheduler shut down".into()),
                        attempt,
                    );
                    state.counters.cancelled_tasks += 1;
                    terminal = true;
                }
                AttemptOutcome::TimedOut => {
                    let error = SchedulerError::TaskTimeout {
                        id: id.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    warn!(task_id = %id, timeout_ms = timeout.as_millis() as u64, "Task timed out");
                    record.finish(TaskStatus::TimedOut, None, Some(error.to_string()), attempt);
                    state.counters.timed_out_tasks += 1;
                    terminal = true;
                }
                AttemptOutcome::Finished(result) => {
                    state.counters.record_execution(result.duration_ms);
                    record.backend = result.backend.clone();
                    if result.success {
                        record.finish(TaskStatus::Succeeded, result.output, None, attempt);
                        state.counters.completed_tasks += 1;
                        terminal = true;
                    } else if record.retry_count < config.retry_attempts {
                        record.retry_count += 1;
                        record.status = TaskStatus::Queued;
                        record.error = result.error;
                        state.counters.retried_tasks += 1;
                        debug!(task_id = %id, retry = record.retry_count, "Re-queueing failed task");
                        // Retries ignore max_queue_size: an admitted task is never dropped.
                        if let Err(e) = state.queue.push(task, usize::MAX) {
                            warn!(task_id = %id, error = %e, "Retry could not be queued");
                        }
                        if state.queue.len() > config.effective_queue_size() {
                            debug!(task_id = %id, queued = state.queue.len(), "Retry queued past capacity");
                        }
                    } else {
                        let message = result
                            .error
                            .unwrap_or_else(|| "task failed on every backend".to_string());
                        let error = SchedulerError::TaskExecutionFailure {
                            id: id.to_string(),
                            message,
                        };
                        warn!(task_id = %id, error = %error, "Task failed");
                        record.finish(TaskStatus::Failed, None, Some(error.to_string()), attempt);
                        state.counters.failed_tasks += 1;
                        terminal = true;
                    }
                }
            }
        }
        if terminal {
            self.publish();
        }
        self.wake.notify_one();
    }

    fn check_auto_scaling(&self) -> ScalingDecision {
        let config = self.config();
        let monitor = self.manager.resource_monitor();
        let (cpu_percent, memory_percent) = match monitor.trend() {
            Some(trend) => (trend.cpu_percent, trend.memory_percent),
            None => {
                let snapshot = monitor.get_current_resources();
                (snapshot.cpu_usage_percent, snapshot.memory_usage_percent())
            }
        };

        let mut state = self.lock_state();
        let inputs = ScalingInputs {
            cpu_percent,
            memory_percent,
            queue_depth: state.queue.len(),
            current_concurrency: config.max_concurrent_tasks,
            concurrency_limit: config.max_concurrency_limit,
        };
        let decision = autoscale::evaluate(&inputs, &config.scaling_thresholds);
        info!(
            action = %decision.action,
            current = decision.current_concurrency,
            recommended = decision.recommended_concurrency,
            reason = %decision.reason,
            "Auto-scaling evaluated"
        );
        state.counters.last_scaling_decision = Some(decision.clone());
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::config::LumenConfig;
    use crate::models::ModelMetadata;
    use crate::resources::{ResourceMonitor, ResourceSampler, ResourceSnapshot, SampleError};
    use crate::types::{ModelFormat, Priority, TaskInput};

    struct NullSampler;

    impl ResourceSampler for NullSampler {
        fn sample(&mut self) -> Result<ResourceSnapshot, SampleError> {
            Err(SampleError("no sampler in tests".into()))
        }
    }

    async fn scheduler(config: SchedulerConfig, latency_ms: u64) -> (TaskScheduler, Arc<SimulatedBackend>) {
        let lumen = LumenConfig::default();
        let resources = Arc::new(ResourceMonitor::with_sampler(lumen.resources, Box::new(NullSampler)));
        let manager = Arc::new(BackendManager::with_resource_monitor(&lumen, resources));
        let onnx = Arc::new(SimulatedBackend::onnx().with_latency(Duration::from_millis(latency_ms)));
        manager.register_backend("onnx", onnx.clone()).await.unwrap();
        manager
            .model_registry()
            .register_model(
                ModelMetadata::new("cls", "Classifier", ModelFormat::Onnx, "c")
                    .with_tasks(["image_classification"]),
            )
            .unwrap();
        (TaskScheduler::new(config, manager).unwrap(), onnx)
    }

    fn task() -> Task {
        Task::new(
            "image_classification",
            "cls",
            TaskInput::new(serde_json::json!({}), "image/jpeg"),
        )
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let (scheduler, _) = scheduler(SchedulerConfig::default(), 1).await;
        scheduler.start();
        let id = scheduler.submit_task(task()).unwrap();
        let result = scheduler
            .wait_for_task(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.backend.as_deref(), Some("onnx"));
        assert_eq!(result.attempts, 1);
        assert!(result.output.is_some());

        let metrics = scheduler.get_metrics();
        assert_eq!(metrics.total_tasks, 1);
        assert_eq!(metrics.completed_tasks, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_full_rejects_submission() {
        let config = SchedulerConfig {
            max_queue_size: 2,
            ..SchedulerConfig::default()
        };
        let (scheduler, _) = scheduler(config, 1).await;
        scheduler.submit_task(task()).unwrap();
        scheduler.submit_task(task()).unwrap();
        let err = scheduler.submit_task(task()).unwrap_err();
        assert!(matches!(err, SchedulerError::QueueFull { max: 2 }));
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let (scheduler, _) = scheduler(SchedulerConfig::default(), 1).await;
        let id = scheduler.submit_task(task()).unwrap();
        assert_eq!(scheduler.get_task_status(id), Some(TaskStatus::Queued));
        assert!(scheduler.get_task_result(id).is_none());

        assert!(scheduler.cancel_task(id));
        assert!(!scheduler.cancel_task(id));
        assert!(!scheduler.cancel_task(TaskId::new_v4()));
        assert_eq!(scheduler.get_task_status(id), Some(TaskStatus::Cancelled));
        assert_eq!(scheduler.get_metrics().queue_length, 0);
        assert_eq!(scheduler.get_metrics().cancelled_tasks, 1);
    }

    #[tokio::test]
    async fn test_cancel_running_task_releases_claim() {
        let (scheduler, _) = scheduler(SchedulerConfig::default(), 2_000).await;
        scheduler.start();
        let id = scheduler.submit_task(task()).unwrap();
        for _ in 0..200 {
            if scheduler.get_task_status(id) == Some(TaskStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(scheduler.get_task_status(id), Some(TaskStatus::Running));

        assert!(scheduler.cancel_task(id));
        let result = scheduler.wait_for_task(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);

        for _ in 0..200 {
            if scheduler.manager().backend_load("onnx") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(scheduler.manager().backend_load("onnx"), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_and_cleanup() {
        let (scheduler, _) = scheduler(SchedulerConfig::default(), 1).await;
        let a = scheduler.submit_task(task().with_priority(Priority::High)).unwrap();
        let b = scheduler.submit_task(task()).unwrap();
        scheduler.cancel_task(a);

        assert_eq!(scheduler.list_tasks(None).len(), 2);
        let queued = scheduler.list_tasks(Some(TaskStatus::Queued));
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id(), b);

        assert_eq!(scheduler.cleanup_finished(), 1);
        assert!(scheduler.get_task(a).is_none());
        assert!(scheduler.get_task(b).is_some());
    }

    #[tokio::test]
    async fn test_wait_for_unknown_task() {
        let (scheduler, _) = scheduler(SchedulerConfig::default(), 1).await;
        let err = scheduler
            .wait_for_task(TaskId::new_v4(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn test_wait_times_out_for_queued_task() {
        let (scheduler, _) = scheduler(SchedulerConfig::default(), 1).await;
        let id = scheduler.submit_task(task()).unwrap();
        let err = scheduler
            .wait_for_task(id, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::TaskTimeout { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let (scheduler, _) = scheduler(SchedulerConfig::default(), 1).await;
        let queued = scheduler.submit_task(task()).unwrap();
        scheduler.shutdown().await;
        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.get_task_status(queued), Some(TaskStatus::Cancelled));
        assert!(matches!(
            scheduler.submit_task(task()),
            Err(SchedulerError::ShutDown)
        ));
        scheduler.shutdown().await;
    }
}
