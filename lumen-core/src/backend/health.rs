//! Health monitor: periodic backend probes driving the health state machine.
//!
//! Each monitored backend gets its own probe task, spawned with a child of the
//! monitor's root `CancellationToken`. Probe outcomes update a per-backend
//! `HealthRecord` which is then pushed to the [`BackendRegistry`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackendHealthReport, BackendRegistry, InferenceBackend};
use crate::config::HealthMonitorConfig;
use crate::types::{HealthRecord, HealthStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Success,
    Failure,
}

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub backend_id: String,
    pub status: CheckOutcome,
    pub response_time_ms: f64,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthCheckResult {
    pub fn is_success(&self) -> bool {
        self.status == CheckOutcome::Success
    }
}

/// Apply one probe outcome to a record. The status moves at most one step,
/// and only when the matching consecutive counter reaches its threshold.
pub fn apply_check_outcome(record: &mut HealthRecord, success: bool, config: &HealthMonitorConfig) {
    if success {
        record.consecutive_failures = 0;
        record.consecutive_successes += 1;
        if record.status != HealthStatus::Healthy
            && record.consecutive_successes >= config.recovery_threshold
        {
            record.status = record.status.recover();
            record.consecutive_successes = 0;
        }
    } else {
        record.consecutive_successes = 0;
        record.consecutive_failures += 1;
        if record.status != HealthStatus::Unavailable
            && record.consecutive_failures >= config.failure_threshold
        {
            record.status = record.status.degrade();
            record.consecutive_failures = 0;
        }
    }
}

struct BackendHealthState {
    record: HealthRecord,
    total_checks: u64,
    failed_checks: u64,
    monitored_since: Instant,
    history: VecDeque<HealthCheckResult>,
}

impl BackendHealthState {
    fn new(record: HealthRecord) -> Self {
        Self {
            record,
            total_checks: 0,
            failed_checks: 0,
            monitored_since: Instant::now(),
            history: VecDeque::new(),
        }
    }
}

struct HealthInner {
    config: HealthMonitorConfig,
    registry: Arc<BackendRegistry>,
    states: RwLock<HashMap<String, BackendHealthState>>,
}

impl HealthInner {
    async fn check(&self, id: &str, backend: &Arc<dyn InferenceBackend>) -> HealthCheckResult {
        let started = Instant::now();
        let probe = tokio::time::timeout(self.config.probe_timeout(), probe(backend.as_ref())).await;
        let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let (report, error) = match probe {
            Ok(Ok(report)) => (Some(report), None),
            Ok(Err(e)) => (None, Some(e)),
            Err(_) => (
                None,
                Some(format!(
                    "probe timed out after {}ms",
                    self.config.probe_timeout_ms
                )),
            ),
        };

        let result = HealthCheckResult {
            backend_id: id.to_string(),
            status: if report.is_some() {
                CheckOutcome::Success
            } else {
                CheckOutcome::Failure
            },
            response_time_ms,
            checked_at: Utc::now(),
            error,
        };
        self.record(id, &result, report.as_ref());
        result
    }

    fn record(&self, id: &str, result: &HealthCheckResult, report: Option<&BackendHealthReport>) {
        let record = {
            let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
            let state = states.entry(id.to_string()).or_insert_with(|| {
                BackendHealthState::new(
                    self.registry
                        .get_backend_health(id)
                        .unwrap_or_else(HealthRecord::healthy),
                )
            });

            state.total_checks += 1;
            if !result.is_success() {
                state.failed_checks += 1;
            }
            let previous = state.record.status;
            apply_check_outcome(&mut state.record, result.is_success(), &self.config);

            let record = &mut state.record;
            record.last_check = Some(result.checked_at);
            record.error_rate = state.failed_checks as f64 / state.total_checks as f64;
            record.avg_response_ms +=
                (result.response_time_ms - record.avg_response_ms) / state.total_checks as f64;
            record.uptime_secs = state.monitored_since.elapsed().as_secs();
            if let Some(report) = report {
                record.active_connections = report.active_connections;
                record.resource_usage = report.resource_usage;
            }

            state.history.push_back(result.clone());
            while state.history.len() > self.config.history_size {
                state.history.pop_front();
            }

            if previous != state.record.status {
                info!(
                    backend_id = %id,
                    from = %previous,
                    to = %state.record.status,
                    "Backend health transition"
                );
            }
            state.record.clone()
        };

        if let Some(error) = &result.error {
            debug!(backend_id = %id, error = %error, "Health probe failed");
        }
        self.registry.update_backend_health(id, record);
    }
}

async fn probe(backend: &dyn InferenceBackend) -> Result<BackendHealthReport, String> {
    if !backend.is_available().await {
        return Err("backend reports unavailable".into());
    }
    let report = backend.get_health().await.map_err(|e| e.to_string())?;
    if report.status == HealthStatus::Unavailable {
        return Err(report
            .message
            .clone()
            .unwrap_or_else(|| "backend health is unavailable".into()));
    }
    Ok(report)
}

struct ProbeTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically probes registered backends.
pub struct HealthMonitor {
    inner: Arc<HealthInner>,
    root: Mutex<CancellationToken>,
    tasks: Mutex<HashMap<String, ProbeTask>>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, registry: Arc<BackendRegistry>) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                config,
                registry,
                states: RwLock::new(HashMap::new()),
            }),
            root: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.inner.config
    }

    /// Probe a registered backend once. Unknown ids yield a failed result.
    pub async fn perform_health_check(&self, id: &str) -> HealthCheckResult {
        match self.inner.registry.get_backend(id) {
            Some(backend) => self.inner.check(id, &backend).await,
            None => {
                warn!(backend_id = %id, "Health check requested for unknown backend");
                HealthCheckResult {
                    backend_id: id.to_string(),
                    status: CheckOutcome::Failure,
                    response_time_ms: 0.0,
                    checked_at: Utc::now(),
                    error: Some(format!("backend {id} is not registered")),
                }
            }
        }
    }

    /// Start probing `backend` every interval. Replaces an existing probe task.
    pub fn monitor_backend(&self, id: &str, backend: Arc<dyn InferenceBackend>) {
        let token = self
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .child_token();
        let inner = self.inner.clone();
        let loop_token = token.clone();
        let backend_id = id.to_string();

        inner
            .states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(backend_id.clone())
            .or_insert_with(|| {
                BackendHealthState::new(
                    inner
                        .registry
                        .get_backend_health(id)
                        .unwrap_or_else(HealthRecord::healthy),
                )
            });

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        // A probe in flight is dropped on cancellation.
                        tokio::select! {
                            _ = loop_token.cancelled() => break,
                            _ = inner.check(&backend_id, &backend) => {}
                        }
                    }
                }
            }
            debug!(backend_id = %backend_id, "Health probe loop stopped");
        });

        let previous = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), ProbeTask { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        debug!(backend_id = %id, interval_ms = self.inner.config.interval_ms, "Monitoring backend");
    }

    /// Stop probing `id` and forget its health state.
    pub async fn unmonitor_backend(&self, id: &str) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }
        self.inner
            .states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn is_monitoring(&self, id: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn get_backend_health(&self, id: &str) -> Option<HealthRecord> {
        self.inner
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|s| s.record.clone())
    }

    pub fn get_all_health(&self) -> HashMap<String, HealthRecord> {
        self.inner
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (id.clone(), s.record.clone()))
            .collect()
    }

    /// Recent probe results for `id`, oldest first.
    pub fn check_history(&self, id: &str) -> Vec<HealthCheckResult> {
        self.inner
            .states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancel every probe task and wait for them to finish.
    pub async fn stop(&self) {
        let old_root = std::mem::replace(
            &mut *self.root.lock().unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        old_root.cancel();

        let tasks: Vec<ProbeTask> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, t)| t)
            .collect();
        let count = tasks.len();
        for task in tasks {
            let _ = task.handle.await;
        }
        if count > 0 {
            info!(stopped = count, "Health monitor stopped");
        }
    }
}
