//! Model catalog behaviour through the public API.

use std::collections::HashSet;
use std::sync::Arc;

use lumen_core::backend::BackendRegistry;
use lumen_core::error::RegistryError;
use lumen_core::models::{ModelMetadata, ModelPerformance, ModelRegistry, ModelVersion, SearchCriteria};
use lumen_core::resources::AllocationTable;
use lumen_core::{ModelFormat, SimulatedBackend};
use pretty_assertions::assert_eq;

fn registry() -> Arc<ModelRegistry> {
    let backends = Arc::new(BackendRegistry::new());
    backends
        .register_backend("tensorflow", Arc::new(SimulatedBackend::tensorflow()))
        .unwrap();
    backends
        .register_backend("onnx", Arc::new(SimulatedBackend::onnx()))
        .unwrap();
    Arc::new(ModelRegistry::new(backends, Arc::new(AllocationTable::new())))
}

fn model(id: &str, format: ModelFormat, task: &str, memory_mb: f64, accuracy: f64) -> ModelMetadata {
    ModelMetadata::new(id, id.to_uppercase(), format, format!("sha-{id}"))
        .with_tasks([task])
        .with_performance(ModelPerformance {
            inference_time_ms: 20.0,
            memory_usage_mb: memory_mb,
            throughput_per_sec: 50.0,
            accuracy,
        })
}

fn seeded() -> Arc<ModelRegistry> {
    let registry = registry();
    for m in [
        model("faces-tf", ModelFormat::TensorFlow, "face_detection", 300.0, 0.90),
        model("faces-lite", ModelFormat::TensorFlowLite, "face_detection", 60.0, 0.84),
        model("faces-onnx", ModelFormat::Onnx, "face_detection", 700.0, 0.95),
        model("clip", ModelFormat::Onnx, "embedding", 350.0, 0.88),
    ] {
        registry.register_model(m).unwrap();
    }
    registry
}

fn ids(models: &[ModelMetadata]) -> Vec<&str> {
    models.iter().map(|m| m.id.as_str()).collect()
}

#[test]
fn test_duplicate_registration_keeps_first() {
    let registry = registry();
    registry
        .register_model(model("m", ModelFormat::Onnx, "ocr", 100.0, 0.5))
        .unwrap();
    let err = registry
        .register_model(model("m", ModelFormat::TensorFlow, "faces", 900.0, 0.9))
        .unwrap_err();
    assert!(matches!(err, RegistryError::DuplicateModel { .. }));

    let kept = registry.get_model("m").unwrap();
    assert_eq!(kept.format, ModelFormat::Onnx);
    assert_eq!(kept.supported_tasks, vec!["ocr".to_string()]);
}

#[test]
fn test_version_equal_to_default_conflicts() {
    let registry = registry();
    registry
        .register_model(model("m", ModelFormat::Onnx, "ocr", 100.0, 0.5))
        .unwrap();
    let err = registry
        .add_model_version("m", ModelVersion::new("1.0.0", "/models/m/1", "a"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::VersionConflict { .. }));

    registry
        .add_model_version("m", ModelVersion::new("2.0.0", "/models/m/2", "b").as_default())
        .unwrap();
    assert_eq!(registry.get_model("m").unwrap().version, "2.0.0");
    let err = registry
        .add_model_version("m", ModelVersion::new("2.0.0", "/models/m/2b", "c"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::VersionConflict { .. }));
    assert_eq!(registry.get_model_versions("m").unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_share_one_instance() {
    let registry = seeded();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.load_model("clip").await.unwrap() })
        })
        .collect();

    let mut instance_ids = HashSet::new();
    for handle in handles {
        instance_ids.insert(handle.await.unwrap().instance_id);
    }
    assert_eq!(instance_ids.len(), 1);
    assert_eq!(registry.list_instances().len(), 1);
}

#[test]
fn test_search_by_format_list() {
    let registry = seeded();
    let criteria = SearchCriteria::new()
        .task_type("face_detection")
        .format(vec![ModelFormat::TensorFlow, ModelFormat::TensorFlowLite]);
    assert_eq!(ids(&registry.search_models(&criteria)), vec!["faces-lite", "faces-tf"]);
}

#[test]
fn test_search_by_memory() {
    let registry = seeded();
    let criteria = SearchCriteria::new().max_memory_mb(400.0);
    assert_eq!(
        ids(&registry.search_models(&criteria)),
        vec!["clip", "faces-lite", "faces-tf"]
    );
}

#[test]
fn test_recommendations_respect_constraints() {
    let registry = seeded();
    let constraints = SearchCriteria::new().max_memory_mb(500.0);
    let recommended = registry.get_recommended_models("face_detection", &constraints);
    assert_eq!(ids(&recommended), vec!["faces-tf", "faces-lite"]);

    let unconstrained = registry.get_recommended_models("face_detection", &SearchCriteria::new());
    assert_eq!(unconstrained[0].id, "faces-onnx");
}

#[tokio::test]
async fn test_usage_stats_accumulate() {
    let registry = seeded();
    let instance = registry.load_model("clip").await.unwrap();

    registry.record_inference(&instance.instance_id, 50.0, true).unwrap();
    registry.record_inference(&instance.instance_id, 75.0, false).unwrap();
    let stats = registry.get_usage_stats("clip").unwrap();
    assert_eq!(stats.total_inferences, 2);
    assert_eq!(stats.total_time_ms, 125.0);
    assert_eq!(stats.average_time_ms, 62.5);
    assert_eq!(stats.success_rate, 0.5);
    assert_eq!(stats.error_count, 1);

    assert!(matches!(
        registry.record_inference("missing", 1.0, true),
        Err(RegistryError::InstanceNotFound { .. })
    ));
}

#[test]
fn test_export_import_round_trip() {
    let source = seeded();
    source
        .add_model_version("clip", ModelVersion::new("1.1.0", "/models/clip/1.1", "sha-clip-11").as_default())
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("catalog").join("models.json");
    source.save_to_file(&path).unwrap();

    let target = registry();
    assert_eq!(target.load_from_file(&path).unwrap(), 4);
    assert_eq!(target.list_models(), source.list_models());
    assert_eq!(
        target.get_model_versions("clip").unwrap(),
        source.get_model_versions("clip").unwrap()
    );
}
