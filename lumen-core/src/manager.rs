//! Backend manager: registers backends, picks the best one for a task,
//! claims resources and executes tasks with fallback.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{
    BackendInfo, BackendRegistry, HealthMonitor, InferenceBackend, InferenceOutput,
};
use crate::config::{LoadBalancingStrategy, LumenConfig};
use crate::error::{BackendError, ConfigError, Result};
use crate::models::ModelRegistry;
use crate::resources::{
    AllocationPurpose, AllocationTable, Capacity, ClaimedResources, ResourceAllocation,
    ResourceMonitor, ResourceSnapshot,
};
use crate::types::{HealthRecord, HealthStatus, ResourceEnvelope, Task, TaskId};

/// Score given to a preferred backend on top of its computed score.
const PREFERRED_BONUS: f64 = 0.15;

/// Neutral performance score for backends with no execution history.
const UNKNOWN_PERFORMANCE: f64 = 0.8;

/// Outcome of backend selection for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSelection {
    pub backend_id: String,
    /// Score of the chosen backend, 0.0 - 1.0.
    pub confidence: f64,
    /// Remaining candidates, best first.
    pub fallbacks: Vec<String>,
    pub scores: BTreeMap<String, f64>,
}

/// Outcome of executing one task through the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub task_id: TaskId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<InferenceOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub duration_ms: f64,
}

/// Execution history of one backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendPerformance {
    pub executions: u64,
    pub successes: u64,
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl BackendPerformance {
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            return 1.0;
        }
        self.successes as f64 / self.executions as f64
    }

    fn record(&mut self, latency_ms: f64, error: Option<String>) {
        self.executions += 1;
        if error.is_none() {
            self.successes += 1;
        }
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.executions as f64;
        if error.is_some() {
            self.last_error = error;
        }
    }
}

/// Read-only view of one backend for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub info: BackendInfo,
    pub health: HealthRecord,
    pub claimed: ClaimedResources,
    pub performance: BackendPerformance,
}

/// Releases a task claim when dropped, including when the owning future is cancelled.
struct ClaimGuard<'a> {
    table: &'a AllocationTable,
    allocation_id: String,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.table.release(&self.allocation_id) {
            debug!(allocation_id = %self.allocation_id, error = %e, "Task claim already released");
        }
    }
}

struct Candidate {
    info: BackendInfo,
    score: f64,
    order: usize,
}

/// Façade over the backend registry, health monitor, resource monitor,
/// model registry and allocation table.
pub struct BackendManager {
    registry: Arc<BackendRegistry>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceMonitor>,
    models: Arc<ModelRegistry>,
    allocations: Arc<AllocationTable>,
    strategy: RwLock<LoadBalancingStrategy>,
    performance: RwLock<HashMap<String, BackendPerformance>>,
    initialized: AtomicBool,
    round_robin: AtomicUsize,
}

impl BackendManager {
    /// Manager sampling the host system.
    pub fn new(config: &LumenConfig) -> Self {
        Self::with_resource_monitor(config, Arc::new(ResourceMonitor::new(config.resources)))
    }

    /// Manager using an existing resource monitor.
    pub fn with_resource_monitor(config: &LumenConfig, resources: Arc<ResourceMonitor>) -> Self {
        let registry = Arc::new(BackendRegistry::new());
        let allocations = Arc::new(AllocationTable::new());
        Self {
            health: Arc::new(HealthMonitor::new(config.health, registry.clone())),
            models: Arc::new(ModelRegistry::new(registry.clone(), allocations.clone())),
            registry,
            resources,
            allocations,
            strategy: RwLock::new(config.scheduler.load_balancing_strategy),
            performance: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn resource_monitor(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn model_registry(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Start resource monitoring. Repeated calls are no-ops.
    pub async fn initialize(&self) -> Result<bool> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(true);
        }
        self.resources.initialize().await;
        info!(
            strategy = ?self.load_balancing_strategy(),
            "Backend manager initialized"
        );
        Ok(true)
    }

    /// Stop timers, release every claim, unload models and shut backends down.
    pub async fn shutdown(&self) {
        let was_initialized = self.initialized.swap(false, Ordering::SeqCst);
        if !was_initialized && self.registry.is_empty() {
            return;
        }

        self.health.stop().await;
        self.resources.shutdown().await;

        let unloaded = self.models.unload_all().await;
        let released = self.allocations.release_all();

        let shutdowns = self.registry.clear().into_iter().map(|(id, backend)| async move {
            if let Err(e) = backend.shutdown().await {
                warn!(backend_id = %id, error = %e, "Backend shutdown failed");
            }
        });
        futures::future::join_all(shutdowns).await;
        self.performance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(unloaded, released, "Backend manager shut down");
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Validate, initialize and register a backend, then start monitoring it.
    pub async fn register_backend(&self, id: &str, backend: Arc<dyn InferenceBackend>) -> Result<()> {
        if self.registry.contains(id) {
            return Err(BackendError::AlreadyRegistered { id: id.to_string() }.into());
        }

        let mut info = backend.info();
        info.id = id.to_string();
        let problems = self.registry.validate_backend_configuration(&info);
        if !problems.is_empty() {
            return Err(ConfigError::invalid(format!("backend.{id}"), problems.join("; ")).into());
        }

        let ready = backend
            .initialize()
            .await
            .map_err(|e| BackendError::Initialization {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        if !ready {
            return Err(BackendError::Initialization {
                id: id.to_string(),
                message: "backend cannot run on this host".into(),
            }
            .into());
        }

        self.registry.register_backend(id, backend.clone())?;
        self.health.monitor_backend(id, backend);
        Ok(())
    }

    /// Stop monitoring, unload models, release claims and remove the backend.
    pub async fn unregister_backend(&self, id: &str) -> Result<()> {
        if !self.registry.contains(id) {
            return Err(BackendError::NotFound { id: id.to_string() }.into());
        }
        self.health.unmonitor_backend(id).await;

        for instance in self
            .models
            .list_instances()
            .into_iter()
            .filter(|i| i.backend_id == id)
        {
            if let Err(e) = self.models.unload_model(&instance.instance_id).await {
                warn!(instance_id = %instance.instance_id, error = %e, "Unload during unregister failed");
            }
        }
        let released = self.allocations.release_backend(id);

        let backend = self.registry.unregister_backend(id)?;
        if let Err(e) = backend.shutdown().await {
            warn!(backend_id = %id, error = %e, "Backend shutdown failed");
        }
        self.performance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        debug!(backend_id = %id, released, "Backend removed from manager");
        Ok(())
    }

    /// Ids of registered backends that are not unavailable.
    pub fn get_available_backends(&self) -> Vec<String> {
        self.registry
            .get_active_backends()
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    // ── Selection ────────────────────────────────────────────────────

    pub fn load_balancing_strategy(&self) -> LoadBalancingStrategy {
        *self.strategy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_load_balancing_strategy(&self, strategy: LoadBalancingStrategy) {
        *self.strategy.write().unwrap_or_else(PoisonError::into_inner) = strategy;
    }

    /// Rank every backend able to run `task` and pick the best one.
    pub fn select_backend(&self, task: &Task) -> std::result::Result<BackendSelection, BackendError> {
        let strategy = self.load_balancing_strategy();
        let model_format = self.models.get_model(&task.model_id).map(|m| m.format);
        let performance = self
            .performance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut candidates: Vec<Candidate> = Vec::new();
        for (order, info) in self.registry.all_info().into_iter().enumerate() {
            let status = self
                .registry
                .get_backend_health(&info.id)
                .map(|h| h.status)
                .unwrap_or(HealthStatus::Unavailable);
            if status == HealthStatus::Unavailable || !info.supports_task(&task.task_type) {
                continue;
            }
            if model_format.is_some_and(|format| !info.supports_format(format)) {
                continue;
            }
            let claimed = self.allocations.claimed(&info.id);
            let Some(headroom) = headroom_score(&info, &claimed, &task.resources) else {
                continue;
            };

            let format_score = if model_format.is_some() { 1.0 } else { 0.5 };
            let capability_score = if info.capabilities.is_empty() { 0.7 } else { 1.0 };
            let match_score = (format_score + capability_score) / 2.0;
            let health_score = match status {
                HealthStatus::Healthy => 1.0,
                _ => 0.5,
            };
            let perf_score = performance
                .get(&info.id)
                .filter(|p| p.executions > 0)
                .map(|p| {
                    let expected = info.performance.expected_inference_ms.max(1.0);
                    let latency = (expected / p.avg_latency_ms.max(1.0)).min(1.0);
                    0.6 * p.success_rate() + 0.4 * latency
                })
                .unwrap_or(UNKNOWN_PERFORMANCE);
            let load_score = 1.0 / (1.0 + claimed.task_allocations as f64);

            let [wm, wh, wr, wp, wl] = strategy_weights(strategy);
            let mut score = wm * match_score
                + wh * health_score
                + wr * headroom
                + wp * perf_score
                + wl * load_score;
            if task.preferred_backend.as_deref() == Some(info.id.as_str()) {
                score += PREFERRED_BONUS;
            }
            candidates.push(Candidate {
                info,
                score: score.clamp(0.0, 1.0),
                order,
            });
        }

        if candidates.is_empty() {
            return Err(BackendError::NoCapableBackend {
                task_type: task.task_type.clone(),
            });
        }

        if strategy == LoadBalancingStrategy::RoundRobin {
            candidates.sort_by_key(|c| c.order);
            let offset = self.round_robin.fetch_add(1, Ordering::SeqCst) % candidates.len();
            candidates.rotate_left(offset);
            if let Some(pos) = candidates
                .iter()
                .position(|c| task.preferred_backend.as_deref() == Some(c.info.id.as_str()))
            {
                let preferred = candidates.remove(pos);
                candidates.insert(0, preferred);
            }
        } else {
            candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.order.cmp(&b.order)));
        }

        // The model's single instance cannot move while it is running, so
        // concurrent tasks for it join the backend that hosts it.
        if let Some(busy) = self.models.busy_backend(&task.model_id) {
            if let Some(pos) = candidates.iter().position(|c| c.info.id == busy) {
                let hosting = candidates.remove(pos);
                candidates.insert(0, hosting);
            }
        }

        let scores = candidates
            .iter()
            .map(|c| (c.info.id.clone(), c.score))
            .collect();
        let mut ids = candidates.iter().map(|c| c.info.id.clone());
        let backend_id = ids.next().unwrap_or_default();
        let selection = BackendSelection {
            backend_id,
            confidence: candidates[0].score,
            fallbacks: ids.collect(),
            scores,
        };
        debug!(
            task_id = %task.id,
            backend_id = %selection.backend_id,
            confidence = selection.confidence,
            fallbacks = selection.fallbacks.len(),
            "Backend selected"
        );
        Ok(selection)
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Run a task on the selected backend, falling back through the
    /// remaining candidates until one succeeds.
    pub async fn execute_task(&self, task: &Task) -> TaskExecutionResult {
        let started = Instant::now();
        let mut result = TaskExecutionResult {
            task_id: task.id,
            success: false,
            backend: None,
            output: None,
            error: None,
            attempts: 0,
            duration_ms: 0.0,
        };

        let selection = match self.select_backend(task) {
            Ok(selection) => selection,
            Err(e) => {
                result.error = Some(e.to_string());
                result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                return result;
            }
        };

        let chain = std::iter::once(selection.backend_id).chain(selection.fallbacks);
        let mut last_error = String::new();
        for backend_id in chain {
            result.attempts += 1;
            match self.attempt(&backend_id, task).await {
                Ok(output) => {
                    result.success = true;
                    result.backend = Some(backend_id);
                    result.output = Some(output);
                    result.error = None;
                    result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                    return result;
                }
                Err(e) => {
                    debug!(task_id = %task.id, backend_id = %backend_id, error = %e, "Attempt failed");
                    last_error = format!("{backend_id}: {e}");
                    result.backend = Some(backend_id);
                }
            }
        }

        warn!(task_id = %task.id, attempts = result.attempts, error = %last_error, "Task failed on every backend");
        result.error = Some(if last_error.is_empty() {
            "no backend attempted the task".to_string()
        } else {
            last_error
        });
        result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        result
    }

    async fn attempt(&self, backend_id: &str, task: &Task) -> Result<InferenceOutput> {
        let allocation =
            self.allocate_resources(backend_id, &task.resources, AllocationPurpose::Task(task.id))?;
        let _claim = ClaimGuard {
            table: &self.allocations,
            allocation_id: allocation.id,
        };

        let started = Instant::now();
        let outcome = self.run_on(backend_id, task).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let error = outcome.as_ref().err().map(ToString::to_string);
        self.performance
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(backend_id.to_string())
            .or_default()
            .record(latency_ms, error);
        outcome
    }

    /// Lease the task's model on `backend_id` and run the inference. The
    /// lease pins the instance until usage is recorded.
    async fn run_on(&self, backend_id: &str, task: &Task) -> Result<InferenceOutput> {
        let backend = self
            .registry
            .get_backend(backend_id)
            .ok_or_else(|| BackendError::NotFound {
                id: backend_id.to_string(),
            })?;
        let lease = self.models.lease_on(&task.model_id, backend_id).await?;

        let started = Instant::now();
        let outcome = backend.run_inference(&task.model_id, &task.input).await;
        let inference_ms = started.elapsed().as_secs_f64() * 1000.0;

        let instance_id = &lease.instance().instance_id;
        if let Err(e) = self
            .models
            .record_inference(instance_id, inference_ms, outcome.is_ok())
        {
            debug!(instance_id = %instance_id, error = %e, "Inference usage not recorded");
        }
        Ok(outcome?)
    }

    // ── Resources ────────────────────────────────────────────────────

    /// Claim resources on a backend, bounded by its declared maximums.
    pub fn allocate_resources(
        &self,
        backend_id: &str,
        envelope: &ResourceEnvelope,
        purpose: AllocationPurpose,
    ) -> std::result::Result<ResourceAllocation, BackendError> {
        let info = self
            .registry
            .get_backend_info(backend_id)
            .ok_or_else(|| BackendError::NotFound {
                id: backend_id.to_string(),
            })?;
        self.allocations
            .allocate(backend_id, envelope, purpose, capacity_of(&info))
    }

    pub fn release_resources(
        &self,
        allocation_id: &str,
    ) -> std::result::Result<ResourceAllocation, BackendError> {
        self.allocations.release(allocation_id)
    }

    pub fn get_allocation(&self, allocation_id: &str) -> Option<ResourceAllocation> {
        self.allocations.get(allocation_id)
    }

    pub fn active_allocations(&self, backend_id: &str) -> Vec<ResourceAllocation> {
        self.allocations.active_for(backend_id)
    }

    pub fn get_system_resources(&self) -> ResourceSnapshot {
        self.resources.get_current_resources()
    }

    /// Status of every registered backend, in registration order.
    pub fn get_backend_statuses(&self) -> Vec<BackendStatus> {
        let performance = self
            .performance
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        self.registry
            .all_info()
            .into_iter()
            .map(|info| BackendStatus {
                health: self
                    .registry
                    .get_backend_health(&info.id)
                    .unwrap_or_default(),
                claimed: self.allocations.claimed(&info.id),
                performance: performance.get(&info.id).cloned().unwrap_or_default(),
                info,
            })
            .collect()
    }

    /// Tasks currently holding a claim on `backend_id`.
    pub fn backend_load(&self, backend_id: &str) -> usize {
        self.allocations.claimed(backend_id).task_allocations
    }

    /// Tasks currently holding a claim, per registered backend.
    pub fn load_distribution(&self) -> BTreeMap<String, usize> {
        self.registry
            .backend_ids()
            .into_iter()
            .map(|id| {
                let load = self.backend_load(&id);
                (id, load)
            })
            .collect()
    }

    pub fn backend_performance(&self, backend_id: &str) -> Option<BackendPerformance> {
        self.performance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(backend_id)
            .cloned()
    }
}

fn capacity_of(info: &BackendInfo) -> Capacity {
    Capacity {
        memory_mb: info.requirements.memory_mb.max,
        cpu_cores: info.requirements.cpu_cores.max,
    }
}

/// Fraction of capacity left after the request, or `None` if it does not fit.
fn headroom_score(info: &BackendInfo, claimed: &ClaimedResources, request: &ResourceEnvelope) -> Option<f64> {
    let capacity = capacity_of(info);
    let free_memory = capacity.memory_mb - claimed.memory_mb as f64 - request.memory_mb as f64;
    let free_cpu = capacity.cpu_cores - claimed.cpu_cores - request.cpu_cores;
    if free_memory < 0.0 || free_cpu < -f64::EPSILON {
        return None;
    }
    let memory = free_memory / capacity.memory_mb.max(1.0);
    let cpu = free_cpu.max(0.0) / capacity.cpu_cores.max(f64::EPSILON);
    Some(((memory + cpu) / 2.0).clamp(0.0, 1.0))
}

/// Weights for match, health, headroom, performance and load.
fn strategy_weights(strategy: LoadBalancingStrategy) -> [f64; 5] {
    match strategy {
        LoadBalancingStrategy::LeastLoaded => [0.2, 0.2, 0.15, 0.15, 0.3],
        LoadBalancingStrategy::Performance => [0.2, 0.2, 0.1, 0.4, 0.1],
        LoadBalancingStrategy::ResourceAware => [0.2, 0.2, 0.4, 0.1, 0.1],
        LoadBalancingStrategy::RoundRobin => [0.25, 0.25, 0.25, 0.25, 0.0],
    }
}
