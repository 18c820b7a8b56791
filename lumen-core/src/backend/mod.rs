//! Inference backend contract, registry and health monitoring.

pub mod health;
pub mod registry;
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BackendError;
use crate::models::ModelMetadata;
use crate::types::{HealthStatus, ModelFormat, ResourceRange, ResourceUsage, TaskInput};

pub use health::{CheckOutcome, HealthCheckResult, HealthMonitor};
pub use registry::BackendRegistry;
pub use simulated::{SimulatedBackend, SimulatedBackendConfig};

/// Backend family, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    TensorFlow,
    Onnx,
    Native,
    Custom,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::TensorFlow => write!(f, "tensorflow"),
            BackendKind::Onnx => write!(f, "onnx"),
            BackendKind::Native => write!(f, "native"),
            BackendKind::Custom => write!(f, "custom"),
        }
    }
}

/// Resources a backend may consume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendRequirements {
    pub memory_mb: ResourceRange,
    pub cpu_cores: ResourceRange,
}

/// Declared performance of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceProfile {
    pub expected_inference_ms: f64,
    pub memory_footprint_mb: f64,
    pub throughput_per_sec: f64,
}

/// Static description of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub kind: BackendKind,
    /// Task-type tags. Empty means the backend is generic.
    pub capabilities: Vec<String>,
    pub supported_formats: Vec<ModelFormat>,
    pub requirements: BackendRequirements,
    pub performance: PerformanceProfile,
    pub supports_batching: bool,
}

impl BackendInfo {
    pub fn supports_task(&self, task_type: &str) -> bool {
        self.capabilities.is_empty() || self.capabilities.iter().any(|c| c == task_type)
    }

    pub fn supports_format(&self, format: ModelFormat) -> bool {
        self.supported_formats.contains(&format)
    }
}

/// Health as reported by the backend itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealthReport {
    pub status: HealthStatus,
    #[serde(default)]
    pub active_connections: u32,
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A model the backend has loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub model_id: String,
    pub memory_mb: f64,
    pub loaded_at: DateTime<Utc>,
}

/// Result of one inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub payload: serde_json::Value,
    pub inference_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Runtime metrics reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendPerformanceMetrics {
    pub total_inferences: u64,
    pub failed_inferences: u64,
    pub average_inference_ms: f64,
    pub loaded_models: usize,
}

/// Contract every execution backend implements.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn info(&self) -> BackendInfo;

    /// Prepare the backend. `Ok(false)` means it cannot run on this host.
    async fn initialize(&self) -> Result<bool, BackendError>;
    async fn shutdown(&self) -> Result<(), BackendError>;
    async fn is_available(&self) -> bool;
    async fn get_health(&self) -> Result<BackendHealthReport, BackendError>;

    async fn load_model(&self, model: &ModelMetadata) -> Result<LoadedModel, BackendError>;
    async fn unload_model(&self, model_id: &str) -> Result<(), BackendError>;
    async fn list_models(&self) -> Vec<String>;

    async fn run_inference(
        &self,
        model_id: &str,
        input: &TaskInput,
    ) -> Result<InferenceOutput, BackendError>;

    /// Run several inputs. Backends without native batching run them in order.
    async fn run_batch_inference(
        &self,
        model_id: &str,
        inputs: &[TaskInput],
    ) -> Result<Vec<InferenceOutput>, BackendError> {
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            outputs.push(self.run_inference(model_id, input).await?);
        }
        Ok(outputs)
    }

    /// Hint that upcoming work is of `task_type`.
    async fn optimize_for_task(&self, _task_type: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn get_performance_metrics(&self) -> BackendPerformanceMetrics;
}
