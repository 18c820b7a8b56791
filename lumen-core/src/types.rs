//! Fundamental types shared across the inference core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a scheduled task.
pub type TaskId = Uuid;

/// Storage format of a model artifact, and the formats a backend can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    TensorFlow,
    #[serde(rename = "tflite")]
    TensorFlowLite,
    Onnx,
    PyTorch,
    CoreMl,
    Native,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelFormat::TensorFlow => "tensorflow",
            ModelFormat::TensorFlowLite => "tflite",
            ModelFormat::Onnx => "onnx",
            ModelFormat::PyTorch => "pytorch",
            ModelFormat::CoreMl => "coreml",
            ModelFormat::Native => "native",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ModelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tensorflow" | "tf" => Ok(ModelFormat::TensorFlow),
            "tflite" | "tensorflow_lite" => Ok(ModelFormat::TensorFlowLite),
            "onnx" => Ok(ModelFormat::Onnx),
            "pytorch" | "torch" => Ok(ModelFormat::PyTorch),
            "coreml" => Ok(ModelFormat::CoreMl),
            "native" => Ok(ModelFormat::Native),
            other => Err(format!("unknown model format: {other}")),
        }
    }
}

/// Task priority tiers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Priority {
    /// Base dispatch weight. Aging adds to this value.
    pub fn weight(self) -> u32 {
        self as u32 + 1
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Resources a single task claims while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_batch_size() -> u32 {
    1
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpu_cores: 1.0,
            batch_size: 1,
        }
    }
}

impl ResourceEnvelope {
    pub fn new(memory_mb: u64, cpu_cores: f64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            batch_size: 1,
        }
    }
}

/// A min / max / optimal triple for a declared resource requirement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRange {
    pub min: f64,
    pub max: f64,
    pub optimal: f64,
}

impl ResourceRange {
    pub fn new(min: f64, max: f64, optimal: f64) -> Self {
        Self { min, max, optimal }
    }
}

/// Rolling health state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

impl HealthStatus {
    /// One step towards `Unavailable`.
    pub fn degrade(self) -> Self {
        match self {
            HealthStatus::Healthy => HealthStatus::Degraded,
            HealthStatus::Degraded | HealthStatus::Unavailable => HealthStatus::Unavailable,
        }
    }

    /// One step towards `Healthy`.
    pub fn recover(self) -> Self {
        match self {
            HealthStatus::Unavailable => HealthStatus::Degraded,
            HealthStatus::Degraded | HealthStatus::Healthy => HealthStatus::Healthy,
        }
    }

    /// Ranking used when ordering candidates (higher is better).
    pub fn rank(self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unavailable => 0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Point-in-time resource usage reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Per-backend health record maintained by the health monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub error_rate: f64,
    pub avg_response_ms: f64,
    pub active_connections: u32,
    pub resource_usage: ResourceUsage,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl HealthRecord {
    /// Fresh record for a newly registered backend.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check: None,
            uptime_secs: 0,
            error_rate: 0.0,
            avg_response_ms: 0.0,
            active_connections: 0,
            resource_usage: ResourceUsage::default(),
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self::healthy()
    }
}

/// Input payload of an inference task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub payload: serde_json::Value,
    /// Declared payload format, e.g. `image/jpeg`, `tensor`, `embedding`.
    pub format: String,
}

impl TaskInput {
    pub fn new(payload: serde_json::Value, format: impl Into<String>) -> Self {
        Self {
            payload,
            format: format.into(),
        }
    }
}

/// A unit of scheduled inference work. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Task type tag, e.g. `face_detection`, `image_classification`.
    pub task_type: String,
    pub model_id: String,
    pub input: TaskInput,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub resources: ResourceEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, model_id: impl Into<String>, input: TaskInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            model_id: model_id.into(),
            input,
            priority: Priority::Normal,
            resources: ResourceEnvelope::default(),
            submitter: None,
            preferred_backend: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resources(mut self, resources: ResourceEnvelope) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Some(submitter.into());
        self
    }

    pub fn with_preferred_backend(mut self, backend_id: impl Into<String>) -> Self {
        self.preferred_backend = Some(backend_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_format_serde_names() {
        assert_eq!(
            serde_json::to_string(&ModelFormat::TensorFlow).unwrap(),
            "\"tensorflow\""
        );
        assert_eq!(
            serde_json::to_string(&ModelFormat::TensorFlowLite).unwrap(),
            "\"tflite\""
        );
        let parsed: ModelFormat = serde_json::from_str("\"pytorch\"").unwrap();
        assert_eq!(parsed, ModelFormat::PyTorch);
    }

    #[test]
    fn test_model_format_from_str() {
        assert_eq!("ONNX".parse::<ModelFormat>().unwrap(), ModelFormat::Onnx);
        assert_eq!("torch".parse::<ModelFormat>().unwrap(), ModelFormat::PyTorch);
        assert!("caffe".parse::<ModelFormat>().is_err());
    }

    #[test]
    fn test_priority_ordering_and_weight() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::Low.weight(), 1);
        assert_eq!(Priority::Critical.weight(), 4);
    }

    #[test]
    fn test_health_status_steps() {
        assert_eq!(HealthStatus::Healthy.degrade(), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.degrade(), HealthStatus::Unavailable);
        assert_eq!(HealthStatus::Unavailable.degrade(), HealthStatus::Unavailable);
        assert_eq!(HealthStatus::Unavailable.recover(), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Degraded.recover(), HealthStatus::Healthy);
        assert_eq!(HealthStatus::Healthy.recover(), HealthStatus::Healthy);
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new(
            "face_detection",
            "blazeface",
            TaskInput::new(serde_json::json!({"path": "a.jpg"}), "image/jpeg"),
        )
        .with_priority(Priority::High)
        .with_submitter("indexer");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.submitter.as_deref(), Some("indexer"));
        assert_eq!(task.resources.batch_size, 1);
    }
}
