//! # Lumen Core
//!
//! Inference backend orchestration for the Lumen photo search application.
//! Provides the backend contract and registry, health and resource
//! monitoring, the model catalog, backend selection with fallback, and a
//! priority task scheduler with retries and auto-scaling advice.

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod resources;
pub mod scheduler;
pub mod types;

// Re-export commonly used types at the crate root.
pub use backend::{
    BackendHealthReport, BackendInfo, BackendKind, BackendRegistry, HealthMonitor, InferenceBackend,
    InferenceOutput, SimulatedBackend,
};
pub use config::{LoadBalancingStrategy, LumenConfig, PriorityMode, SchedulerConfig, SchedulerConfigUpdate};
pub use error::{BackendError, ConfigError, LumenError, RegistryError, Result, SchedulerError};
pub use manager::{BackendManager, BackendSelection, BackendStatus, TaskExecutionResult};
pub use models::{ModelMetadata, ModelRegistry, SearchCriteria};
pub use resources::{AllocationTable, ResourceMonitor, ResourceSnapshot};
pub use scheduler::{ScalingAction, ScalingDecision, SchedulerMetrics, TaskScheduler, TaskStatus};
pub use types::{
    HealthStatus, ModelFormat, Priority, ResourceEnvelope, Task, TaskId, TaskInput,
};
