//! System resource sampling and per-backend resource claims.

pub mod allocation;
pub mod monitor;
pub mod snapshot;

pub use allocation::{
    AllocationPurpose, AllocationStatus, AllocationTable, Capacity, ClaimedResources,
    ResourceAllocation,
};
pub use monitor::{ResourceMonitor, ResourceSampler, SampleError, SystemSampler};
pub use snapshot::{NetworkQuality, ResourceSnapshot, ResourceTrend};
