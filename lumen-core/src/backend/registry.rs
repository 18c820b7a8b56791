//! Registered backends with their static metadata and live health.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use super::{BackendInfo, InferenceBackend};
use crate::error::BackendError;
use crate::types::{HealthRecord, HealthStatus, ModelFormat, ResourceRange};

struct BackendEntry {
    backend: Arc<dyn InferenceBackend>,
    info: BackendInfo,
    health: HealthRecord,
    seq: u64,
}

/// Canonical store of registered backends.
pub struct BackendRegistry {
    entries: RwLock<HashMap<String, BackendEntry>>,
    next_seq: AtomicU64,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register `backend` under `id`. A duplicate id leaves the existing entry untouched.
    pub fn register_backend(
        &self,
        id: &str,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<(), BackendError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(id) {
            return Err(BackendError::AlreadyRegistered { id: id.to_string() });
        }
        let mut info = backend.info();
        info.id = id.to_string();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        info!(backend_id = %id, kind = %info.kind, "Backend registered");
        entries.insert(
            id.to_string(),
            BackendEntry {
                backend,
                info,
                health: HealthRecord::healthy(),
                seq,
            },
        );
        Ok(())
    }

    pub fn unregister_backend(&self, id: &str) -> Result<Arc<dyn InferenceBackend>, BackendError> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(entry) => {
                info!(backend_id = %id, "Backend unregistered");
                Ok(entry.backend)
            }
            None => Err(BackendError::NotFound { id: id.to_string() }),
        }
    }

    /// Remove every backend, returning them in registration order.
    pub fn clear(&self) -> Vec<(String, Arc<dyn InferenceBackend>)> {
        let mut entries: Vec<_> = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        entries.sort_by_key(|(_, e)| e.seq);
        entries.into_iter().map(|(id, e)| (id, e.backend)).collect()
    }

    pub fn get_backend(&self, id: &str) -> Option<Arc<dyn InferenceBackend>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|e| e.backend.clone())
    }

    pub fn get_backend_info(&self, id: &str) -> Option<BackendInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|e| e.info.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// All ids, in registration order.
    pub fn backend_ids(&self) -> Vec<String> {
        self.ordered(|_| true)
            .into_iter()
            .map(|(id, _, _)| id)
            .collect()
    }

    /// Backends that are not `Unavailable`, in registration order.
    pub fn get_active_backends(&self) -> Vec<(String, Arc<dyn InferenceBackend>)> {
        self.ordered(|e| e.health.status != HealthStatus::Unavailable)
            .into_iter()
            .map(|(id, backend, _)| (id, backend))
            .collect()
    }

    /// Static info of every backend, in registration order.
    pub fn all_info(&self) -> Vec<BackendInfo> {
        self.ordered(|_| true)
            .into_iter()
            .map(|(_, _, info)| info)
            .collect()
    }

    fn ordered(
        &self,
        filter: impl Fn(&BackendEntry) -> bool,
    ) -> Vec<(String, Arc<dyn InferenceBackend>, BackendInfo)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut selected: Vec<&BackendEntry> = entries.values().filter(|e| filter(e)).collect();
        selected.sort_by_key(|e| e.seq);
        selected
            .into_iter()
            .map(|e| (e.info.id.clone(), e.backend.clone(), e.info.clone()))
            .collect()
    }

    /// Best backend for a task type, preferring an exact format match, then
    /// better health, then higher declared throughput, then earlier registration.
    pub fn find_optimal_backend(
        &self,
        task_type: &str,
        preferred_format: Option<ModelFormat>,
    ) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .values()
            .filter(|e| e.health.status != HealthStatus::Unavailable)
            .filter(|e| e.info.supports_task(task_type))
            .max_by(|a, b| {
                let format_match = |e: &BackendEntry| {
                    preferred_format.is_some_and(|f| e.info.supports_format(f))
                };
                format_match(a)
                    .cmp(&format_match(b))
                    .then(a.health.status.rank().cmp(&b.health.status.rank()))
                    .then(
                        a.info
                            .performance
                            .throughput_per_sec
                            .total_cmp(&b.info.performance.throughput_per_sec),
                    )
                    // Earlier registration wins, so compare in reverse.
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|e| e.info.id.clone())
    }

    /// Problems with a backend's declared configuration. Empty means valid.
    pub fn validate_backend_configuration(&self, info: &BackendInfo) -> Vec<String> {
        let mut errors = Vec::new();
        if info.id.trim().is_empty() {
            errors.push("backend id must not be empty".to_string());
        }
        if info.name.trim().is_empty() {
            errors.push("backend name must not be empty".to_string());
        }
        if info.version.trim().is_empty() {
            errors.push("backend version must not be empty".to_string());
        }
        if info.capabilities.is_empty() {
            debug!(backend_id = %info.id, "Backend declares no capabilities; treated as generic");
        }
        if info.supported_formats.is_empty() {
            errors.push("backend must support at least one model format".to_string());
        }
        check_range("memory_mb", &info.requirements.memory_mb, &mut errors);
        check_range("cpu_cores", &info.requirements.cpu_cores, &mut errors);

        let perf = &info.performance;
        for (name, value) in [
            ("expected_inference_ms", perf.expected_inference_ms),
            ("memory_footprint_mb", perf.memory_footprint_mb),
            ("throughput_per_sec", perf.throughput_per_sec),
        ] {
            if !value.is_finite() || value < 0.0 {
                errors.push(format!("performance.{name} must be a non-negative number"));
            }
        }
        errors
    }

    /// Replace the live health record. Unknown ids are ignored.
    pub fn update_backend_health(&self, id: &str, record: HealthRecord) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(id) {
            Some(entry) => {
                if entry.health.status != record.status {
                    info!(
                        backend_id = %id,
                        from = %entry.health.status,
                        to = %record.status,
                        "Backend health changed"
                    );
                }
                entry.health = record;
            }
            None => warn!(backend_id = %id, "Health update for unknown backend ignored"),
        }
    }

    pub fn get_backend_health(&self, id: &str) -> Option<HealthRecord> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|e| e.health.clone())
    }

    pub fn health_snapshot(&self) -> HashMap<String, HealthRecord> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, e)| (id.clone(), e.health.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_range(name: &str, range: &ResourceRange, errors: &mut Vec<String>) {
    if !(range.min.is_finite() && range.max.is_finite() && range.optimal.is_finite()) {
        errors.push(format!("requirements.{name} values must be finite"));
        return;
    }
    if range.max <= 0.0 {
        errors.push(format!("requirements.{name}.max must be positive"));
    }
    if range.min > range.max {
        errors.push(format!("requirements.{name}.min exceeds max"));
    }
    if range.optimal < range.min || range.optimal > range.max {
        errors.push(format!("requirements.{name}.optimal must lie within [min, max]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;

    fn registry_with(backends: Vec<SimulatedBackend>) -> BackendRegistry {
        let registry = BackendRegistry::new();
        for backend in backends {
            let id = backend.info().id;
            registry.register_backend(&id, Arc::new(backend)).unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let registry = registry_with(vec![SimulatedBackend::tensorflow()]);
        let err = registry
            .register_backend("tensorflow", Arc::new(SimulatedBackend::onnx()))
            .unwrap_err();
        assert!(matches!(err, BackendError::AlreadyRegistered { .. }));
        assert_eq!(registry.len(), 1);
        let info = registry.get_backend_info("tensorflow").unwrap();
        assert_eq!(info.name, "TensorFlow (simulated)");
    }

    #[test]
    fn test_unregister_unknown() {
        let registry = BackendRegistry::new();
        assert!(matches!(
            registry.unregister_backend("nope"),
            Err(BackendError::NotFound { .. })
        ));
    }

    #[test]
    fn test_ids_in_registration_order() {
        let registry = registry_with(vec![
            SimulatedBackend::native(),
            SimulatedBackend::onnx(),
            SimulatedBackend::tensorflow(),
        ]);
        assert_eq!(registry.backend_ids(), vec!["native", "onnx", "tensorflow"]);
    }

    #[test]
    fn test_find_optimal_prefers_format_then_throughput() {
        let registry = registry_with(vec![
            SimulatedBackend::tensorflow(),
            SimulatedBackend::onnx(),
        ]);
        // Both classify; TF matches the format despite lower throughput.
        assert_eq!(
            registry
                .find_optimal_backend("image_classification", Some(ModelFormat::TensorFlow))
                .as_deref(),
            Some("tensorflow")
        );
        // No format preference: ONNX has higher throughput.
        assert_eq!(
            registry
                .find_optimal_backend("image_classification", None)
                .as_deref(),
            Some("onnx")
        );
        assert_eq!(
            registry.find_optimal_backend("face_detection", None).as_deref(),
            Some("tensorflow")
        );
        assert!(registry.find_optimal_backend("speech", None).is_none());
    }

    #[test]
    fn test_find_optimal_skips_unavailable_and_ranks_health() {
        let registry = registry_with(vec![
            SimulatedBackend::onnx(),
            SimulatedBackend::onnx().with_id("onnx-2"),
        ]);
        // Equal in every respect: registration order decides.
        assert_eq!(
            registry.find_optimal_backend("ocr", None).as_deref(),
            Some("onnx")
        );

        let degraded = HealthRecord {
            status: HealthStatus::Degraded,
            ..HealthRecord::healthy()
        };
        registry.update_backend_health("onnx", degraded);
        assert_eq!(
            registry.find_optimal_backend("ocr", None).as_deref(),
            Some("onnx-2")
        );

        let down = HealthRecord {
            status: HealthStatus::Unavailable,
            ..HealthRecord::healthy()
        };
        registry.update_backend_health("onnx-2", down.clone());
        registry.update_backend_health("onnx", down);
        assert!(registry.find_optimal_backend("ocr", None).is_none());
        assert!(registry.get_active_backends().is_empty());
    }

    #[test]
    fn test_validate_configuration() {
        let registry = BackendRegistry::new();
        assert!(registry
            .validate_backend_configuration(&SimulatedBackend::onnx().info())
            .is_empty());

        let mut info = SimulatedBackend::onnx().info();
        info.name.clear();
        info.supported_formats.clear();
        info.requirements.memory_mb = ResourceRange::new(512.0, 256.0, 300.0);
        info.performance.throughput_per_sec = f64::NAN;
        let errors = registry.validate_backend_configuration(&info);
        assert!(errors.iter().any(|e| e.contains("name")));
        assert!(errors.iter().any(|e| e.contains("format")));
        assert!(errors.iter().any(|e| e.contains("min exceeds max")));
        assert!(errors.iter().any(|e| e.contains("throughput_per_sec")));
    }

    #[test]
    fn test_health_update_unknown_is_noop() {
        let registry = BackendRegistry::new();
        registry.update_backend_health("ghost", HealthRecord::healthy());
        assert!(registry.get_backend_health("ghost").is_none());
        assert!(registry.health_snapshot().is_empty());
    }
}
