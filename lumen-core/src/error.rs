//! Error types for the Lumen inference core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering the model registry, backends, scheduling, and configuration.

use std::path::PathBuf;

/// Top-level error type for the Lumen core library.
#[derive(Debug, thiserror::Error)]
pub enum LumenError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the model registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid model metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Model already exists: {id}")]
    DuplicateModel { id: String },

    #[error("Model not found: {id}")]
    ModelNotFound { id: String },

    #[error("Version {version} conflicts with an existing version of model {model_id}")]
    VersionConflict { model_id: String, version: String },

    #[error("Version {version} not found for model {model_id}")]
    VersionNotFound { model_id: String, version: String },

    #[error("Model instance not found: {id}")]
    InstanceNotFound { id: String },

    #[error("Model {model_id} is running on {backend_id} and cannot move")]
    InstanceBusy { model_id: String, backend_id: String },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

/// Errors from backend registration, resource allocation, and inference.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend {id} is unavailable")]
    BackendUnavailable { id: String },

    #[error("Backend already registered: {id}")]
    AlreadyRegistered { id: String },

    #[error("Backend not found: {id}")]
    NotFound { id: String },

    #[error("Backend {id} failed to initialize: {message}")]
    Initialization { id: String, message: String },

    #[error("Resource exhausted on backend {id}: {resource} requested {requested}, available {available}")]
    ResourceExhausted {
        id: String,
        resource: String,
        requested: f64,
        available: f64,
    },

    #[error("Resource allocation not found: {id}")]
    AllocationNotFound { id: String },

    #[error("Resource allocation already released: {id}")]
    AllocationAlreadyReleased { id: String },

    #[error("No capable backend for task type '{task_type}'")]
    NoCapableBackend { task_type: String },

    #[error("Inference failed on backend {id}: {message}")]
    Inference { id: String, message: String },
}

/// Errors from the task scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task queue is full (max {max})")]
    QueueFull { max: usize },

    #[error("Task {id} timed out after {timeout_ms}ms")]
    TaskTimeout { id: String, timeout_ms: u64 },

    #[error("Task {id} failed: {message}")]
    TaskExecutionFailure { id: String, message: String },

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Scheduler has been shut down")]
    ShutDown,
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration for '{field}': {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl BackendError {
    pub fn inference(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Inference {
            id: id.into(),
            message: message.into(),
        }
    }
}

/// A type alias for results using the top-level `LumenError`.
pub type Result<T> = std::result::Result<T, LumenError>;
