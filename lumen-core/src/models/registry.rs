//! Model registry: catalog, versions, resident instances and usage accounting.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::metadata::{ModelInstance, ModelMetadata, ModelVersion};
use super::search::SearchCriteria;
use super::usage::UsageStats;
use crate::backend::BackendRegistry;
use crate::error::{BackendError, RegistryError, Result};
use crate::resources::{AllocationPurpose, AllocationTable, Capacity};
use crate::types::{HealthStatus, ResourceEnvelope};

struct ModelRecord {
    metadata: ModelMetadata,
    versions: Vec<ModelVersion>,
    usage: UsageStats,
}

impl ModelRecord {
    fn new(metadata: ModelMetadata) -> Self {
        Self {
            metadata,
            versions: Vec::new(),
            usage: UsageStats::default(),
        }
    }
}

#[derive(Default)]
struct CatalogState {
    models: BTreeMap<String, ModelRecord>,
    instances: HashMap<String, ModelInstance>,
    /// Inferences currently running per instance id.
    in_use: HashMap<String, usize>,
}

impl CatalogState {
    fn instance_for(&self, model_id: &str) -> Option<&ModelInstance> {
        self.instances.values().find(|i| i.model_id == model_id)
    }
}

/// Keeps an instance resident while an inference runs on it. Dropping the
/// lease lets the instance move or unload again.
pub struct InstanceLease<'a> {
    registry: &'a ModelRegistry,
    instance: ModelInstance,
}

impl InstanceLease<'_> {
    pub fn instance(&self) -> &ModelInstance {
        &self.instance
    }
}

impl Drop for InstanceLease<'_> {
    fn drop(&mut self) {
        let mut state = self
            .registry
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = state.in_use.get_mut(&self.instance.instance_id) {
            *count -= 1;
            if *count == 0 {
                state.in_use.remove(&self.instance.instance_id);
            }
        }
    }
}

/// One model in a registry export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedModel {
    pub metadata: ModelMetadata,
    #[serde(default)]
    pub versions: Vec<ModelVersion>,
}

/// Serializable snapshot of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryExport {
    pub exported_at: DateTime<Utc>,
    pub models: Vec<ExportedModel>,
}

/// Catalog of models and the instances currently loaded on backends.
pub struct ModelRegistry {
    backends: Arc<BackendRegistry>,
    allocations: Arc<AllocationTable>,
    state: RwLock<CatalogState>,
    load_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ModelRegistry {
    pub fn new(backends: Arc<BackendRegistry>, allocations: Arc<AllocationTable>) -> Self {
        Self {
            backends,
            allocations,
            state: RwLock::new(CatalogState::default()),
            load_locks: Mutex::new(HashMap::new()),
        }
    }

    // ── Catalog ──────────────────────────────────────────────────────

    pub fn register_model(&self, metadata: ModelMetadata) -> std::result::Result<(), RegistryError> {
        metadata.validate()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.models.contains_key(&metadata.id) {
            return Err(RegistryError::DuplicateModel { id: metadata.id });
        }
        info!(model_id = %metadata.id, format = %metadata.format, "Model registered");
        state
            .models
            .insert(metadata.id.clone(), ModelRecord::new(metadata));
        Ok(())
    }

    /// Remove a model, unloading its resident instance first.
    pub async fn unregister_model(&self, model_id: &str) -> Result<ModelMetadata> {
        if self.get_model(model_id).is_none() {
            return Err(RegistryError::ModelNotFound {
                id: model_id.to_string(),
            }
            .into());
        }
        let lock = self.load_lock(model_id);
        let _guard = lock.lock().await;

        if let Some(instance) = self.instance_for_model(model_id) {
            self.unload_model(&instance.instance_id).await?;
        }
        let removed = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .remove(model_id);
        self.load_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(model_id);
        match removed {
            Some(record) => {
                info!(model_id = %model_id, "Model unregistered");
                Ok(record.metadata)
            }
            None => Err(RegistryError::ModelNotFound {
                id: model_id.to_string(),
            }
            .into()),
        }
    }

    pub fn get_model(&self, model_id: &str) -> Option<ModelMetadata> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .get(model_id)
            .map(|r| r.metadata.clone())
    }

    /// All models, sorted by id.
    pub fn list_models(&self) -> Vec<ModelMetadata> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .values()
            .map(|r| r.metadata.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Versions ─────────────────────────────────────────────────────

    pub fn add_model_version(
        &self,
        model_id: &str,
        version: ModelVersion,
    ) -> std::result::Result<(), RegistryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let record = state
            .models
            .get_mut(model_id)
            .ok_or_else(|| RegistryError::ModelNotFound {
                id: model_id.to_string(),
            })?;

        let conflict = version.version == record.metadata.version
            || record.versions.iter().any(|v| v.version == version.version);
        if conflict {
            return Err(RegistryError::VersionConflict {
                model_id: model_id.to_string(),
                version: version.version,
            });
        }

        if version.is_default {
            for existing in &mut record.versions {
                existing.is_default = false;
            }
            record.metadata.version = version.version.clone();
            record.metadata.updated_at = Utc::now();
        }
        debug!(model_id = %model_id, version = %version.version, "Model version added");
        record.versions.push(version);
        Ok(())
    }

    pub fn get_model_versions(&self, model_id: &str) -> Option<Vec<ModelVersion>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .get(model_id)
            .map(|r| r.versions.clone())
    }

    /// Make a recorded version the model's default.
    pub fn set_default_version(
        &self,
        model_id: &str,
        version: &str,
    ) -> std::result::Result<(), RegistryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let record = state
            .models
            .get_mut(model_id)
            .ok_or_else(|| RegistryError::ModelNotFound {
                id: model_id.to_string(),
            })?;
        if !record.versions.iter().any(|v| v.version == version) {
            return Err(RegistryError::VersionNotFound {
                model_id: model_id.to_string(),
                version: version.to_string(),
            });
        }
        for v in &mut record.versions {
            v.is_default = v.version == version;
        }
        record.metadata.version = version.to_string();
        record.metadata.updated_at = Utc::now();
        info!(model_id = %model_id, version = %version, "Default model version changed");
        Ok(())
    }

    /// Hash the artifact of a version with SHA-256 and compare it to the
    /// recorded checksum.
    pub async fn verify_version_checksum(&self, model_id: &str, version: &str) -> Result<()> {
        let entry = self
            .get_model_versions(model_id)
            .ok_or_else(|| RegistryError::ModelNotFound {
                id: model_id.to_string(),
            })?
            .into_iter()
            .find(|v| v.version == version)
            .ok_or_else(|| RegistryError::VersionNotFound {
                model_id: model_id.to_string(),
                version: version.to_string(),
            })?;

        let bytes = tokio::fs::read(&entry.storage_path).await?;
        let actual = format!("{:x}", Sha256::digest(&bytes));
        if !actual.eq_ignore_ascii_case(entry.checksum.trim()) {
            return Err(RegistryError::ChecksumMismatch {
                path: entry.storage_path,
                expected: entry.checksum,
                actual,
            }
            .into());
        }
        Ok(())
    }

    // ── Instances ────────────────────────────────────────────────────

    fn load_lock(&self, model_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.load_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model_id.to_string())
            .or_default()
            .clone()
    }

    fn backend_usable(&self, backend_id: &str) -> bool {
        self.backends
            .get_backend_health(backend_id)
            .is_some_and(|h| h.status != HealthStatus::Unavailable)
    }

    /// Return the resident instance of a model, loading it on the best backend
    /// if none is usable. Concurrent calls for one model share a single load.
    pub async fn load_model(&self, model_id: &str) -> Result<ModelInstance> {
        let metadata = self
            .get_model(model_id)
            .ok_or_else(|| RegistryError::ModelNotFound {
                id: model_id.to_string(),
            })?;
        let lock = self.load_lock(model_id);
        let _guard = lock.lock().await;

        if let Some(instance) = self.instance_for_model(model_id) {
            if self.backend_usable(&instance.backend_id) {
                return Ok(self.touch(&instance.instance_id).unwrap_or(instance));
            }
            debug!(model_id = %model_id, backend_id = %instance.backend_id, "Dropping stale instance");
            self.unload_model(&instance.instance_id).await?;
        }

        let task_type = metadata.supported_tasks.first().cloned().unwrap_or_default();
        let backend_id = self
            .backends
            .find_optimal_backend(&task_type, Some(metadata.format))
            .ok_or(BackendError::NoCapableBackend { task_type })?;
        self.load_on_backend(&metadata, &backend_id).await
    }

    /// Ensure the model is resident on `backend_id`, moving it there if it is
    /// loaded elsewhere and idle.
    pub async fn load_model_on(&self, model_id: &str, backend_id: &str) -> Result<ModelInstance> {
        let metadata = self
            .get_model(model_id)
            .ok_or_else(|| RegistryError::ModelNotFound {
                id: model_id.to_string(),
            })?;
        let lock = self.load_lock(model_id);
        let _guard = lock.lock().await;
        self.resident_on(&metadata, backend_id).await
    }

    /// Like [`load_model_on`](Self::load_model_on), but the instance stays
    /// put until the returned lease is dropped.
    pub async fn lease_on(&self, model_id: &str, backend_id: &str) -> Result<InstanceLease<'_>> {
        let metadata = self
            .get_model(model_id)
            .ok_or_else(|| RegistryError::ModelNotFound {
                id: model_id.to_string(),
            })?;
        let lock = self.load_lock(model_id);
        let _guard = lock.lock().await;
        let instance = self.resident_on(&metadata, backend_id).await?;
        *self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .entry(instance.instance_id.clone())
            .or_default() += 1;
        Ok(InstanceLease {
            registry: self,
            instance,
        })
    }

    /// Caller holds the model's load lock.
    async fn resident_on(&self, metadata: &ModelMetadata, backend_id: &str) -> Result<ModelInstance> {
        let Some(current) = self.instance_for_model(&metadata.id) else {
            return self.load_on_backend(metadata, backend_id).await;
        };
        if current.backend_id == backend_id {
            return Ok(self.touch(&current.instance_id).unwrap_or(current));
        }
        if self.in_use_count(&current.instance_id) > 0 {
            return Err(RegistryError::InstanceBusy {
                model_id: metadata.id.clone(),
                backend_id: current.backend_id,
            }
            .into());
        }

        debug!(
            model_id = %metadata.id,
            from = %current.backend_id,
            to = %backend_id,
            "Migrating model instance"
        );
        // A failed load leaves the current instance where it is.
        let moved = self.load_on_backend(metadata, backend_id).await?;
        self.unload_model(&current.instance_id).await?;
        Ok(moved)
    }

    /// Number of inferences currently holding a lease on the instance.
    pub fn in_use_count(&self, instance_id: &str) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Backend hosting the model's instance while an inference runs on it.
    pub fn busy_backend(&self, model_id: &str) -> Option<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let instance = state.instance_for(model_id)?;
        state
            .in_use
            .contains_key(&instance.instance_id)
            .then(|| instance.backend_id.clone())
    }

    async fn load_on_backend(&self, metadata: &ModelMetadata, backend_id: &str) -> Result<ModelInstance> {
        let backend = self
            .backends
            .get_backend(backend_id)
            .ok_or_else(|| BackendError::NotFound {
                id: backend_id.to_string(),
            })?;
        let info = self
            .backends
            .get_backend_info(backend_id)
            .ok_or_else(|| BackendError::NotFound {
                id: backend_id.to_string(),
            })?;

        let loaded = backend.load_model(metadata).await?;
        let claim = ResourceEnvelope::new(loaded.memory_mb.ceil() as u64, 0.0);
        let capacity = Capacity {
            memory_mb: info.requirements.memory_mb.max,
            cpu_cores: info.requirements.cpu_cores.max,
        };
        let allocation = match self.allocations.allocate(
            backend_id,
            &claim,
            AllocationPurpose::Model(metadata.id.clone()),
            capacity,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                if let Err(unload) = backend.unload_model(&metadata.id).await {
                    warn!(backend_id = %backend_id, error = %unload, "Unload after failed claim errored");
                }
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let instance = ModelInstance {
            instance_id: Uuid::new_v4().to_string(),
            model_id: metadata.id.clone(),
            backend_id: backend_id.to_string(),
            loaded_at: now,
            last_used_at: now,
            memory_mb: loaded.memory_mb,
            allocation_id: Some(allocation.id),
        };
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .insert(instance.instance_id.clone(), instance.clone());
        info!(
            model_id = %metadata.id,
            backend_id = %backend_id,
            instance_id = %instance.instance_id,
            memory_mb = loaded.memory_mb,
            "Model loaded"
        );
        Ok(instance)
    }

    fn touch(&self, instance_id: &str) -> Option<ModelInstance> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let instance = state.instances.get_mut(instance_id)?;
        instance.last_used_at = Utc::now();
        Some(instance.clone())
    }

    /// Remove an instance and unload it from its backend. Backend errors are logged.
    pub async fn unload_model(&self, instance_id: &str) -> Result<()> {
        let instance = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .remove(instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound {
                id: instance_id.to_string(),
            })?;

        if let Some(backend) = self.backends.get_backend(&instance.backend_id) {
            if let Err(e) = backend.unload_model(&instance.model_id).await {
                warn!(
                    backend_id = %instance.backend_id,
                    model_id = %instance.model_id,
                    error = %e,
                    "Backend failed to unload model"
                );
            }
        }
        if let Some(allocation_id) = &instance.allocation_id {
            if let Err(e) = self.allocations.release(allocation_id) {
                debug!(allocation_id = %allocation_id, error = %e, "Model allocation already gone");
            }
        }
        info!(model_id = %instance.model_id, instance_id = %instance_id, "Model unloaded");
        Ok(())
    }

    /// Unload every instance. Returns how many were unloaded.
    pub async fn unload_all(&self) -> usize {
        let ids: Vec<String> = self
            .list_instances()
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        let mut unloaded = 0;
        for id in ids {
            if self.unload_model(&id).await.is_ok() {
                unloaded += 1;
            }
        }
        unloaded
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<ModelInstance> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .get(instance_id)
            .cloned()
    }

    pub fn list_instances(&self) -> Vec<ModelInstance> {
        let mut instances: Vec<ModelInstance> = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instances
            .values()
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        instances
    }

    pub fn instance_for_model(&self, model_id: &str) -> Option<ModelInstance> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .instance_for(model_id)
            .cloned()
    }

    // ── Usage ────────────────────────────────────────────────────────

    pub fn record_inference(
        &self,
        instance_id: &str,
        duration_ms: f64,
        success: bool,
    ) -> std::result::Result<(), RegistryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound {
                id: instance_id.to_string(),
            })?;
        instance.last_used_at = Utc::now();
        let model_id = instance.model_id.clone();
        if let Some(record) = state.models.get_mut(&model_id) {
            record.usage.record(duration_ms, success);
        }
        Ok(())
    }

    pub fn get_usage_stats(&self, model_id: &str) -> Option<UsageStats> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .get(model_id)
            .map(|r| r.usage.clone())
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Models matching every constrained field of `criteria`, sorted by id.
    pub fn search_models(&self, criteria: &SearchCriteria) -> Vec<ModelMetadata> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .models
            .values()
            .filter(|r| criteria.matches(&r.metadata))
            .map(|r| r.metadata.clone())
            .collect()
    }

    /// Models for `task_type` that satisfy `constraints`, best accuracy first.
    pub fn get_recommended_models(
        &self,
        task_type: &str,
        constraints: &SearchCriteria,
    ) -> Vec<ModelMetadata> {
        let mut criteria = constraints.clone();
        criteria.task_type = Some(task_type.to_string());
        let mut models = self.search_models(&criteria);
        // Stable sort keeps id order among equal accuracies.
        models.sort_by(|a, b| b.performance.accuracy.total_cmp(&a.performance.accuracy));
        models
    }

    // ── Persistence ──────────────────────────────────────────────────

    pub fn export_registry(&self) -> RegistryExport {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        RegistryExport {
            exported_at: Utc::now(),
            models: state
                .models
                .values()
                .map(|r| ExportedModel {
                    metadata: r.metadata.clone(),
                    versions: r.versions.clone(),
                })
                .collect(),
        }
    }

    /// Merge an export into the catalog. Models with matching ids are
    /// replaced; usage stats of replaced models are kept.
    pub fn import_registry(&self, export: RegistryExport) -> std::result::Result<usize, RegistryError> {
        for model in &export.models {
            model.metadata.validate()?;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let count = export.models.len();
        for model in export.models {
            match state.models.entry(model.metadata.id.clone()) {
                Entry::Occupied(mut entry) => {
                    let record = entry.get_mut();
                    record.metadata = model.metadata;
                    record.versions = model.versions;
                }
                Entry::Vacant(entry) => {
                    let mut record = ModelRecord::new(model.metadata);
                    record.versions = model.versions;
                    entry.insert(record);
                }
            }
        }
        info!(imported = count, "Model registry imported");
        Ok(count)
    }

    /// Write the catalog to `path` as pretty JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.export_registry())?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "Model registry saved");
        Ok(())
    }

    /// Import a catalog previously written by [`save_to_file`](Self::save_to_file).
    pub fn load_from_file(&self, path: &Path) -> Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let export: RegistryExport = serde_json::from_str(&contents)?;
        Ok(self.import_registry(export)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::models::metadata::ModelPerformance;
    use crate::types::ModelFormat;

    fn registry() -> (Arc<BackendRegistry>, Arc<AllocationTable>, ModelRegistry) {
        let backends = Arc::new(BackendRegistry::new());
        backends
            .register_backend("tensorflow", Arc::new(SimulatedBackend::tensorflow()))
            .unwrap();
        backends
            .register_backend("onnx", Arc::new(SimulatedBackend::onnx()))
            .unwrap();
        let allocations = Arc::new(AllocationTable::new());
        let models = ModelRegistry::new(backends.clone(), allocations.clone());
        (backends, allocations, models)
    }

    fn face_model() -> ModelMetadata {
        ModelMetadata::new("face", "Face detector", ModelFormat::TensorFlow, "abc")
            .with_tasks(["face_detection"])
    }

    #[test]
    fn test_register_rejects_invalid_and_duplicate() {
        let (_, _, models) = registry();
        let mut bad = face_model();
        bad.checksum.clear();
        assert!(matches!(
            models.register_model(bad),
            Err(RegistryError::InvalidMetadata { .. })
        ));
        models.register_model(face_model()).unwrap();
        assert!(matches!(
            models.register_model(face_model()),
            Err(RegistryError::DuplicateModel { .. })
        ));
        assert_eq!(models.len(), 1);
        assert_eq!(models.get_usage_stats("face").unwrap().total_inferences, 0);
    }

    #[test]
    fn test_version_rules() {
        let (_, _, models) = registry();
        models.register_model(face_model()).unwrap();

        let err = models
            .add_model_version("face", ModelVersion::new("1.0.0", "/m/face-1", "abc"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::VersionConflict { .. }));

        models
            .add_model_version("face", ModelVersion::new("1.1.0", "/m/face-11", "def"))
            .unwrap();
        assert!(models
            .add_model_version("face", ModelVersion::new("1.1.0", "/m/x", "x"))
            .is_err());

        models
            .add_model_version("face", ModelVersion::new("2.0.0", "/m/face-2", "123").as_default())
            .unwrap();
        assert_eq!(models.get_model("face").unwrap().version, "2.0.0");

        models.set_default_version("face", "1.1.0").unwrap();
        let versions = models.get_model_versions("face").unwrap();
        assert_eq!(versions.iter().filter(|v| v.is_default).count(), 1);
        assert_eq!(models.get_model("face").unwrap().version, "1.1.0");
        assert!(matches!(
            models.set_default_version("face", "9.9.9"),
            Err(RegistryError::VersionNotFound { .. })
        ));
        assert!(matches!(
            models.add_model_version("ghost", ModelVersion::new("1", "/x", "x")),
            Err(RegistryError::ModelNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_reuses_instance_and_claims_memory() {
        let (_, allocations, models) = registry();
        models.register_model(face_model()).unwrap();
        let first = models.load_model("face").await.unwrap();
        assert_eq!(first.backend_id, "tensorflow");
        assert!(first.allocation_id.is_some());
        assert_eq!(allocations.claimed("tensorflow").memory_mb, 128);

        let second = models.load_model("face").await.unwrap();
        assert_eq!(first.instance_id, second.instance_id);

        models.unload_model(&first.instance_id).await.unwrap();
        assert_eq!(allocations.claimed("tensorflow").memory_mb, 0);
        assert!(matches!(
            models.unload_model(&first.instance_id).await,
            Err(crate::error::LumenError::Registry(
                RegistryError::InstanceNotFound { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_resident_instance() {
        let (_, allocations, models) = registry();
        let model = ModelMetadata::new("cls", "Classifier", ModelFormat::Onnx, "c")
            .with_tasks(["image_classification"]);
        models.register_model(model).unwrap();
        let on_onnx = models.load_model("cls").await.unwrap();
        assert_eq!(on_onnx.backend_id, "onnx");

        // TF cannot load ONNX artifacts.
        assert!(models.load_model_on("cls", "tensorflow").await.is_err());
        let resident = models.instance_for_model("cls").unwrap();
        assert_eq!(resident.instance_id, on_onnx.instance_id);
        assert_eq!(resident.backend_id, "onnx");
        assert_eq!(allocations.claimed("onnx").allocations, 1);
        assert_eq!(allocations.claimed("tensorflow").allocations, 0);
    }

    #[tokio::test]
    async fn test_idle_instance_migrates_busy_one_stays() {
        let (backends, allocations, models) = registry();
        let second = Arc::new(SimulatedBackend::onnx());
        backends.register_backend("onnx-2", second.clone()).unwrap();
        let model = ModelMetadata::new("cls", "Classifier", ModelFormat::Onnx, "c")
            .with_tasks(["image_classification"]);
        models.register_model(model).unwrap();

        let lease = models.lease_on("cls", "onnx").await.unwrap();
        let leased_id = lease.instance().instance_id.clone();
        assert_eq!(models.in_use_count(&leased_id), 1);
        assert_eq!(models.busy_backend("cls").as_deref(), Some("onnx"));

        let err = models.load_model_on("cls", "onnx-2").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::LumenError::Registry(RegistryError::InstanceBusy { .. })
        ));
        assert_eq!(models.instance_for_model("cls").unwrap().instance_id, leased_id);
        // A second lease on the same backend shares the instance.
        let shared = models.lease_on("cls", "onnx").await.unwrap();
        assert_eq!(shared.instance().instance_id, leased_id);
        assert_eq!(models.in_use_count(&leased_id), 2);

        drop(shared);
        drop(lease);
        assert_eq!(models.in_use_count(&leased_id), 0);
        assert!(models.busy_backend("cls").is_none());

        let moved = models.load_model_on("cls", "onnx-2").await.unwrap();
        assert_eq!(moved.backend_id, "onnx-2");
        assert_ne!(moved.instance_id, leased_id);
        assert_eq!(models.list_instances().len(), 1);
        assert_eq!(second.loaded_models(), vec!["cls"]);
        assert_eq!(allocations.claimed("onnx").allocations, 0);
        assert_eq!(allocations.claimed("onnx-2").allocations, 1);
    }

    #[tokio::test]
    async fn test_load_unknown_model() {
        let (_, _, models) = registry();
        assert!(models.load_model("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_unloads_instance() {
        let (_, allocations, models) = registry();
        models.register_model(face_model()).unwrap();
        models.load_model("face").await.unwrap();
        models.unregister_model("face").await.unwrap();
        assert!(models.get_model("face").is_none());
        assert!(models.list_instances().is_empty());
        assert_eq!(allocations.active_count(), 0);
        assert!(models.unregister_model("face").await.is_err());
    }

    #[tokio::test]
    async fn test_verify_checksum() {
        let (_, _, models) = registry();
        models.register_model(face_model()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.pb");
        std::fs::write(&path, b"weights").unwrap();
        let digest = format!("{:x}", Sha256::digest(b"weights"));

        models
            .add_model_version("face", ModelVersion::new("1.1.0", &path, digest.to_uppercase()))
            .unwrap();
        models
            .add_model_version("face", ModelVersion::new("1.2.0", &path, "deadbeef"))
            .unwrap();
        models.verify_version_checksum("face", "1.1.0").await.unwrap();
        let err = models
            .verify_version_checksum("face", "1.2.0")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
    }

    #[test]
    fn test_recommendations_sorted_by_accuracy() {
        let (_, _, models) = registry();
        for (id, accuracy) in [("b", 0.8), ("a", 0.8), ("c", 0.95)] {
            models
                .register_model(
                    ModelMetadata::new(id, id, ModelFormat::Onnx, "c")
                        .with_tasks(["ocr"])
                        .with_performance(ModelPerformance {
                            accuracy,
                            ..Default::default()
                        }),
                )
                .unwrap();
        }
        let ids: Vec<String> = models
            .get_recommended_models("ocr", &SearchCriteria::new())
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(models
            .get_recommended_models("speech", &SearchCriteria::new())
            .is_empty());
    }
}
