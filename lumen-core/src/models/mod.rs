//! Model catalog: metadata, versions, loaded instances and usage.

pub mod metadata;
pub mod registry;
pub mod search;
pub mod usage;

pub use metadata::{
    BackendRequirement, ModelCapability, ModelInstance, ModelMetadata, ModelPerformance,
    ModelVersion, SystemRequirements,
};
pub use registry::{ExportedModel, InstanceLease, ModelRegistry, RegistryExport};
pub use search::{FormatFilter, SearchCriteria};
pub use usage::UsageStats;
