//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, ModelsAction};
use lumen_core::backend::SimulatedBackend;
use lumen_core::models::{ModelPerformance, ModelRegistry};
use lumen_core::scheduler::TaskStatus;
use lumen_core::{
    BackendManager, LumenConfig, ModelFormat, ModelMetadata, Priority, SchedulerConfigUpdate,
    SearchCriteria, Task, TaskInput, TaskScheduler,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Task types exercised by `simulate`, with the catalog model serving each.
const WORKLOAD: &[(&str, &str)] = &[
    ("face_detection", "blazeface"),
    ("image_classification", "mobilenet-v3"),
    ("embedding", "clip-vit-b32"),
    ("ocr", "paddle-ocr"),
    ("object_detection", "yolo-v8n"),
];

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: LumenConfig, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Status => handle_status(&config, workspace).await,
        Commands::Simulate { tasks, concurrency } => {
            handle_simulate(&config, workspace, tasks, concurrency).await
        }
        Commands::Models { action } => handle_models(action, &config, workspace).await,
        Commands::Config { action } => handle_config(action, &config, workspace),
    }
}

fn handle_config(action: ConfigAction, config: &LumenConfig, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let path = lumen_core::config::workspace_config_path(workspace);
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let path = lumen_core::config::save_workspace_config(workspace, &LumenConfig::default())?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}

/// Manager with the three simulated backends registered.
async fn build_manager(config: &LumenConfig) -> anyhow::Result<Arc<BackendManager>> {
    let manager = Arc::new(BackendManager::new(config));
    manager.initialize().await?;
    let backends = [
        ("tensorflow", SimulatedBackend::tensorflow()),
        ("onnx", SimulatedBackend::onnx()),
        ("native", SimulatedBackend::native()),
    ];
    for (id, backend) in backends {
        manager
            .register_backend(id, Arc::new(backend.with_id(id)))
            .await?;
    }
    Ok(manager)
}

fn catalog_path(config: &LumenConfig, workspace: &Path, explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| config.registry.catalog_path.clone())
        .unwrap_or_else(|| workspace.join(".lumen").join("models.json"))
}

fn model(
    id: &str,
    name: &str,
    format: ModelFormat,
    task: &str,
    performance: (f64, f64, f64, f64),
) -> ModelMetadata {
    let (inference_time_ms, memory_usage_mb, throughput_per_sec, accuracy) = performance;
    ModelMetadata::new(id, name, format, format!("builtin:{id}"))
        .with_tasks([task])
        .with_tags(["builtin"])
        .with_performance(ModelPerformance {
            inference_time_ms,
            memory_usage_mb,
            throughput_per_sec,
            accuracy,
        })
}

/// Models shipped with the CLI so commands work on an empty workspace.
pub fn builtin_models() -> Vec<ModelMetadata> {
    vec![
        model("blazeface", "BlazeFace Detector", ModelFormat::TensorFlowLite, "face_detection", (12.0, 48.0, 80.0, 0.91)),
        model("mobilenet-v3", "MobileNet V3 Classifier", ModelFormat::Onnx, "image_classification", (18.0, 96.0, 55.0, 0.87)),
        model("efficientnet-b4", "EfficientNet B4 Classifier", ModelFormat::Onnx, "image_classification", (65.0, 420.0, 15.0, 0.93)),
        model("clip-vit-b32", "CLIP ViT-B/32 Embedder", ModelFormat::Onnx, "embedding", (40.0, 350.0, 25.0, 0.90)),
        model("paddle-ocr", "PaddleOCR Recognizer", ModelFormat::Onnx, "ocr", (90.0, 260.0, 11.0, 0.88)),
        model("yolo-v8n", "YOLOv8 Nano Detector", ModelFormat::TensorFlow, "object_detection", (35.0, 310.0, 28.0, 0.86)),
    ]
}

/// Seed the built-in models, then merge the stored catalog if present.
fn load_catalog(registry: &ModelRegistry, path: &Path) -> anyhow::Result<()> {
    for metadata in builtin_models() {
        registry.register_model(metadata)?;
    }
    if path.exists() {
        let imported = registry.load_from_file(path)?;
        tracing::debug!(path = %path.display(), imported, "Catalog loaded");
    }
    Ok(())
}

async fn handle_status(config: &LumenConfig, workspace: &Path) -> anyhow::Result<()> {
    let manager = build_manager(config).await?;
    load_catalog(manager.model_registry(), &catalog_path(config, workspace, None))?;

    let snapshot = manager.resource_monitor().sample_now().await.unwrap_or_else(|| manager.get_system_resources());
    println!("System: {}", snapshot.summary());
    println!("Models: {} in catalog", manager.model_registry().len());
    println!();
    println!("{:<12} {:<11} {:<10} {:>10} {:>8} {:>10}", "BACKEND", "KIND", "HEALTH", "CLAIMED MB", "RUNS", "LATENCY");
    for status in manager.get_backend_statuses() {
        println!(
            "{:<12} {:<11} {:<10} {:>10} {:>8} {:>8.1}ms",
            status.info.id,
            status.info.kind,
            status.health.status,
            status.claimed.memory_mb,
            status.performance.executions,
            status.performance.avg_latency_ms,
        );
    }

    manager.shutdown().await;
    Ok(())
}

async fn handle_simulate(
    config: &LumenConfig,
    workspace: &Path,
    tasks: usize,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    let manager = build_manager(config).await?;
    load_catalog(manager.model_registry(), &catalog_path(config, workspace, None))?;

    let scheduler = TaskScheduler::new(config.scheduler, manager.clone())?;
    if let Some(max) = concurrency {
        scheduler.update_config(&SchedulerConfigUpdate {
            max_concurrent_tasks: Some(max),
            max_concurrency_limit: Some(max.max(config.scheduler.max_concurrency_limit)),
            ..Default::default()
        })?;
    }
    scheduler.start();

    let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Critical];
    let mut ids = Vec::with_capacity(tasks);
    for i in 0..tasks {
        let (task_type, model_id) = WORKLOAD[i % WORKLOAD.len()];
        let input = TaskInput::new(serde_json::json!({ "photo": format!("IMG_{i:04}.jpg") }), "image/jpeg");
        let task = Task::new(task_type, model_id, input)
            .with_priority(priorities[i % priorities.len()])
            .with_submitter(format!("library-{}", i % 3));
        ids.push(scheduler.submit_task(task)?);
    }
    println!("Submitted {} tasks", ids.len());

    let cfg = scheduler.config();
    let wait = cfg.task_timeout() * (cfg.retry_attempts + 1) + Duration::from_secs(5);
    let mut outcomes: BTreeMap<String, usize> = BTreeMap::new();
    for id in ids {
        let status = match scheduler.wait_for_task(id, wait).await {
            Ok(result) => result.status,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Task did not finish");
                scheduler.get_task_status(id).unwrap_or(TaskStatus::Failed)
            }
        };
        *outcomes.entry(status.to_string()).or_default() += 1;
    }

    println!("Outcomes: {}", serde_json::to_string(&outcomes)?);
    println!(
        "Backend load: {}",
        serde_json::to_string(&scheduler.get_backend_load_distribution())?
    );
    for status in manager.get_backend_statuses() {
        println!(
            "  {:<12} {:>4} runs  {:>5.1}% ok  {:>7.1}ms avg",
            status.info.id,
            status.performance.executions,
            status.performance.success_rate() * 100.0,
            status.performance.avg_latency_ms,
        );
    }

    let decision = scheduler.check_auto_scaling();
    println!(
        "Auto-scaling: {} ({} -> {}): {}",
        decision.action, decision.current_concurrency, decision.recommended_concurrency, decision.reason
    );
    println!("{}", serde_json::to_string_pretty(&scheduler.get_metrics())?);

    scheduler.shutdown().await;
    Ok(())
}

async fn handle_models(action: ModelsAction, config: &LumenConfig, workspace: &Path) -> anyhow::Result<()> {
    let manager = BackendManager::new(config);
    let registry = manager.model_registry();

    match action {
        ModelsAction::List { catalog } => {
            load_catalog(registry, &catalog_path(config, workspace, catalog))?;
            print_models(&registry.list_models());
        }
        ModelsAction::Search {
            task,
            format,
            max_memory,
            min_accuracy,
            query,
            catalog,
        } => {
            load_catalog(registry, &catalog_path(config, workspace, catalog))?;
            let mut criteria = SearchCriteria::new();
            if let Some(task) = task {
                criteria = criteria.task_type(task);
            }
            if !format.is_empty() {
                let formats = format
                    .iter()
                    .map(|f| f.parse::<ModelFormat>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| anyhow::anyhow!(e))?;
                criteria = criteria.format(formats);
            }
            if let Some(mb) = max_memory {
                criteria = criteria.max_memory_mb(mb);
            }
            if let Some(accuracy) = min_accuracy {
                criteria = criteria.min_accuracy(accuracy);
            }
            if let Some(query) = query {
                criteria = criteria.query(query);
            }
            print_models(&registry.search_models(&criteria));
        }
        ModelsAction::Export { path, catalog } => {
            load_catalog(registry, &catalog_path(config, workspace, catalog))?;
            registry.save_to_file(&path)?;
            println!("Exported {} models to {}", registry.len(), path.display());
        }
        ModelsAction::Import { path, catalog } => {
            let target = catalog_path(config, workspace, catalog);
            load_catalog(registry, &target)?;
            let imported = registry.load_from_file(&path)?;
            registry.save_to_file(&target)?;
            println!("Imported {imported} models into {}", target.display());
        }
    }

    manager.shutdown().await;
    Ok(())
}

fn print_models(models: &[ModelMetadata]) {
    if models.is_empty() {
        println!("No models found.");
        return;
    }
    println!("{:<18} {:<10} {:<22} {:>8} {:>8}", "ID", "FORMAT", "TASKS", "MEM MB", "ACC");
    for m in models {
        println!(
            "{:<18} {:<10} {:<22} {:>8.0} {:>8.2}",
            m.id,
            m.format,
            m.supported_tasks.join(","),
            m.expected_memory_mb(),
            m.performance.accuracy,
        );
    }
}
