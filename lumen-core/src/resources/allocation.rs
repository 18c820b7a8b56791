//! Logical resource claims against a backend's declared capacity.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BackendError;
use crate::types::{ResourceEnvelope, TaskId};

/// Released allocations kept for inspection before being evicted.
const RELEASED_RETENTION: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Active,
    Released,
}

/// What an allocation is held for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AllocationPurpose {
    Task(TaskId),
    Model(String),
}

/// A claim of memory and CPU against one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: String,
    pub backend_id: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub purpose: AllocationPurpose,
    pub status: AllocationStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ResourceAllocation {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }
}

/// Declared maximum capacity of a backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capacity {
    pub memory_mb: f64,
    pub cpu_cores: f64,
}

/// Memory and CPU currently claimed on a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimedResources {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub allocations: usize,
    pub task_allocations: usize,
}

#[derive(Default)]
struct TableInner {
    allocations: HashMap<String, ResourceAllocation>,
    released: VecDeque<String>,
}

impl TableInner {
    fn claimed(&self, backend_id: &str) -> ClaimedResources {
        self.allocations
            .values()
            .filter(|a| a.is_active() && a.backend_id == backend_id)
            .fold(ClaimedResources::default(), |mut acc, a| {
                acc.memory_mb += a.memory_mb;
                acc.cpu_cores += a.cpu_cores;
                acc.allocations += 1;
                if matches!(a.purpose, AllocationPurpose::Task(_)) {
                    acc.task_allocations += 1;
                }
                acc
            })
    }

    fn mark_released(&mut self, id: &str) -> Option<ResourceAllocation> {
        let allocation = self.allocations.get_mut(id)?;
        allocation.status = AllocationStatus::Released;
        allocation.ended_at = Some(Utc::now());
        let released = allocation.clone();
        self.released.push_back(id.to_string());
        while self.released.len() > RELEASED_RETENTION {
            if let Some(old) = self.released.pop_front() {
                self.allocations.remove(&old);
            }
        }
        Some(released)
    }
}

/// Table of allocations. Capacity checks and inserts happen under one lock,
/// so concurrent claims against the same backend cannot overshoot.
#[derive(Default)]
pub struct AllocationTable {
    inner: Mutex<TableInner>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `envelope` on `backend_id`, rejecting claims beyond `capacity`.
    pub fn allocate(
        &self,
        backend_id: &str,
        envelope: &ResourceEnvelope,
        purpose: AllocationPurpose,
        capacity: Capacity,
    ) -> Result<ResourceAllocation, BackendError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let claimed = inner.claimed(backend_id);

        let free_memory = capacity.memory_mb - claimed.memory_mb as f64;
        if envelope.memory_mb as f64 > free_memory {
            return Err(BackendError::ResourceExhausted {
                id: backend_id.to_string(),
                resource: "memory_mb".into(),
                requested: envelope.memory_mb as f64,
                available: free_memory.max(0.0),
            });
        }
        let free_cpu = capacity.cpu_cores - claimed.cpu_cores;
        if envelope.cpu_cores > free_cpu + f64::EPSILON {
            return Err(BackendError::ResourceExhausted {
                id: backend_id.to_string(),
                resource: "cpu_cores".into(),
                requested: envelope.cpu_cores,
                available: free_cpu.max(0.0),
            });
        }

        let allocation = ResourceAllocation {
            id: Uuid::new_v4().to_string(),
            backend_id: backend_id.to_string(),
            memory_mb: envelope.memory_mb,
            cpu_cores: envelope.cpu_cores,
            purpose,
            status: AllocationStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
        };
        inner
            .allocations
            .insert(allocation.id.clone(), allocation.clone());
        Ok(allocation)
    }

    /// Release an active allocation.
    pub fn release(&self, allocation_id: &str) -> Result<ResourceAllocation, BackendError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.allocations.get(allocation_id) {
            None => Err(BackendError::AllocationNotFound {
                id: allocation_id.to_string(),
            }),
            Some(a) if !a.is_active() => Err(BackendError::AllocationAlreadyReleased {
                id: allocation_id.to_string(),
            }),
            Some(_) => inner
                .mark_released(allocation_id)
                .ok_or_else(|| BackendError::AllocationNotFound {
                    id: allocation_id.to_string(),
                }),
        }
    }

    /// Release every active allocation on one backend. Returns how many.
    pub fn release_backend(&self, backend_id: &str) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = inner
            .allocations
            .values()
            .filter(|a| a.is_active() && a.backend_id == backend_id)
            .map(|a| a.id.clone())
            .collect();
        for id in &ids {
            inner.mark_released(id);
        }
        ids.len()
    }

    /// Release every active allocation. Returns how many.
    pub fn release_all(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let ids: Vec<String> = inner
            .allocations
            .values()
            .filter(|a| a.is_active())
            .map(|a| a.id.clone())
            .collect();
        for id in &ids {
            inner.mark_released(id);
        }
        ids.len()
    }

    pub fn get(&self, allocation_id: &str) -> Option<ResourceAllocation> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocations
            .get(allocation_id)
            .cloned()
    }

    /// Active allocations on `backend_id`.
    pub fn active_for(&self, backend_id: &str) -> Vec<ResourceAllocation> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocations
            .values()
            .filter(|a| a.is_active() && a.backend_id == backend_id)
            .cloned()
            .collect()
    }

    /// Totals currently claimed on `backend_id`.
    pub fn claimed(&self, backend_id: &str) -> ClaimedResources {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .claimed(backend_id)
    }

    /// Number of active allocations across all backends.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocations
            .values()
            .filter(|a| a.is_active())
            .count()
    }
}
