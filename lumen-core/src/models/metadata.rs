//! Model catalog records.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::types::ModelFormat;

/// Format and version a specific backend needs to run a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequirement {
    pub format: ModelFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemRequirements {
    pub min_memory_mb: u64,
    pub min_cpu_cores: f64,
    #[serde(default)]
    pub gpu_required: bool,
    #[serde(default)]
    pub min_storage_mb: u64,
}

impl Default for SystemRequirements {
    fn default() -> Self {
        Self {
            min_memory_mb: 128,
            min_cpu_cores: 1.0,
            gpu_required: false,
            min_storage_mb: 0,
        }
    }
}

/// Declared performance characteristics of a model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub inference_time_ms: f64,
    pub memory_usage_mb: f64,
    pub throughput_per_sec: f64,
    /// 0.0 - 1.0
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCapability {
    pub capability_type: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// Descriptive record of a model in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Current default version.
    pub version: String,
    pub format: ModelFormat,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub parameters: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub backend_requirements: HashMap<String, BackendRequirement>,
    #[serde(default)]
    pub system_requirements: SystemRequirements,
    #[serde(default)]
    pub performance: ModelPerformance,
    #[serde(default)]
    pub capabilities: Vec<ModelCapability>,
    #[serde(default)]
    pub supported_tasks: Vec<String>,
}

impl ModelMetadata {
    /// Minimal record with sensible defaults; callers fill in the rest.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        format: ModelFormat,
        checksum: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: "1.0.0".into(),
            format,
            size_bytes: 0,
            parameters: 0,
            checksum: checksum.into(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            categories: Vec::new(),
            backend_requirements: HashMap::new(),
            system_requirements: SystemRequirements::default(),
            performance: ModelPerformance::default(),
            capabilities: Vec::new(),
            supported_tasks: Vec::new(),
        }
    }

    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_performance(mut self, performance: ModelPerformance) -> Self {
        self.performance = performance;
        self
    }

    pub fn with_system_requirements(mut self, requirements: SystemRequirements) -> Self {
        self.system_requirements = requirements;
        self
    }

    pub fn with_capability(mut self, capability: ModelCapability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Check the invariants a model must satisfy to enter the catalog.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidMetadata {
            reason: reason.to_string(),
        };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(invalid("version must not be empty"));
        }
        if self.checksum.trim().is_empty() {
            return Err(invalid("checksum must not be empty"));
        }
        if self.system_requirements.min_memory_mb == 0 {
            return Err(invalid("system_requirements.min_memory_mb must be positive"));
        }
        Ok(())
    }

    pub fn supports_task(&self, task_type: &str) -> bool {
        self.supported_tasks.iter().any(|t| t == task_type)
    }

    /// Memory the model is expected to use: its measured footprint, or the
    /// declared minimum when no measurement exists.
    pub fn expected_memory_mb(&self) -> f64 {
        if self.performance.memory_usage_mb > 0.0 {
            self.performance.memory_usage_mb
        } else {
            self.system_requirements.min_memory_mb as f64
        }
    }
}

/// A stored version of a model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: String,
    pub storage_path: PathBuf,
    pub checksum: String,
    #[serde(default)]
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_default: bool,
}

impl ModelVersion {
    pub fn new(
        version: impl Into<String>,
        storage_path: impl Into<PathBuf>,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            storage_path: storage_path.into(),
            checksum: checksum.into(),
            size_bytes: 0,
            created_at: Utc::now(),
            is_default: false,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// A model resident on a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstance {
    pub instance_id: String,
    pub model_id: String,
    pub backend_id: String,
    pub loaded_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub memory_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModelMetadata {
        ModelMetadata::new("face-v1", "Face detector", ModelFormat::TensorFlow, "abc123")
            .with_tasks(["face_detection"])
    }

    #[test]
    fn test_valid_metadata() {
        assert!(sample().validate().is_ok());
        assert!(sample().supports_task("face_detection"));
        assert!(!sample().supports_task("ocr"));
    }

    #[test]
    fn test_invalid_metadata() {
        let mut m = sample();
        m.id = " ".into();
        assert!(m.validate().is_err());

        let mut m = sample();
        m.checksum.clear();
        let err = m.validate().unwrap_err();
        assert!(err.to_string().contains("checksum"));

        let m = sample().with_system_requirements(SystemRequirements {
            min_memory_mb: 0,
            ..Default::default()
        });
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_expected_memory_falls_back_to_requirements() {
        let m = sample();
        assert_eq!(m.expected_memory_mb(), 128.0);
        let m = m.with_performance(ModelPerformance {
            memory_usage_mb: 300.0,
            ..Default::default()
        });
        assert_eq!(m.expected_memory_mb(), 300.0);
    }

    #[test]
    fn test_metadata_deserializes_with_defaults() {
        let json = serde_json::json!({
            "id": "ocr",
            "name": "OCR",
            "version": "2.0.0",
            "format": "onnx",
            "checksum": "ff",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        });
        let m: ModelMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(m.format, ModelFormat::Onnx);
        assert!(m.tags.is_empty());
        assert_eq!(m.system_requirements.min_memory_mb, 128);
    }
}
