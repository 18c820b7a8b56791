//! In-process backend with scripted behaviour.
//!
//! Stands in for real execution engines in the CLI and in tests: latency is
//! fixed, failures are scripted, and availability can be toggled at runtime.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    BackendHealthReport, BackendInfo, BackendKind, BackendPerformanceMetrics, BackendRequirements,
    InferenceBackend, InferenceOutput, LoadedModel, PerformanceProfile,
};
use crate::error::BackendError;
use crate::models::ModelMetadata;
use crate::types::{HealthStatus, ModelFormat, ResourceRange, ResourceUsage, TaskInput};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulatedBackendConfig {
    /// Fixed latency of every inference call.
    pub latency_ms: u64,
    /// Whether `initialize()` reports success.
    pub initialize_ok: bool,
    /// Confidence attached to every output.
    pub confidence: f64,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        Self {
            latency_ms: 10,
            initialize_ok: true,
            confidence: 0.9,
        }
    }
}

pub struct SimulatedBackend {
    info: BackendInfo,
    config: SimulatedBackendConfig,
    available: AtomicBool,
    failing: AtomicBool,
    scripted_failures: Mutex<VecDeque<String>>,
    reported_status: Mutex<Option<HealthStatus>>,
    loaded: Mutex<BTreeSet<String>>,
    metrics: Mutex<BackendPerformanceMetrics>,
    calls: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new(info: BackendInfo, config: SimulatedBackendConfig) -> Self {
        Self {
            info,
            config,
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            scripted_failures: Mutex::new(VecDeque::new()),
            reported_status: Mutex::new(None),
            loaded: Mutex::new(BTreeSet::new()),
            metrics: Mutex::new(BackendPerformanceMetrics::default()),
            calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// TensorFlow-style backend for detection and classification.
    pub fn tensorflow() -> Self {
        Self::new(
            BackendInfo {
                id: "tensorflow".into(),
                name: "TensorFlow (simulated)".into(),
                version: "2.15.0".into(),
                kind: BackendKind::TensorFlow,
                capabilities: vec![
                    "face_detection".into(),
                    "image_classification".into(),
                    "object_detection".into(),
                ],
                supported_formats: vec![ModelFormat::TensorFlow, ModelFormat::TensorFlowLite],
                requirements: BackendRequirements {
                    memory_mb: ResourceRange::new(256.0, 4096.0, 1024.0),
                    cpu_cores: ResourceRange::new(1.0, 8.0, 2.0),
                },
                performance: PerformanceProfile {
                    expected_inference_ms: 45.0,
                    memory_footprint_mb: 512.0,
                    throughput_per_sec: 20.0,
                },
                supports_batching: true,
            },
            SimulatedBackendConfig {
                latency_ms: 15,
                ..Default::default()
            },
        )
    }

    /// ONNX-style backend for classification, embeddings and OCR.
    pub fn onnx() -> Self {
        Self::new(
            BackendInfo {
                id: "onnx".into(),
                name: "ONNX Runtime (simulated)".into(),
                version: "1.17.0".into(),
                kind: BackendKind::Onnx,
                capabilities: vec![
                    "image_classification".into(),
                    "embedding".into(),
                    "ocr".into(),
                ],
                supported_formats: vec![ModelFormat::Onnx],
                requirements: BackendRequirements {
                    memory_mb: ResourceRange::new(128.0, 2048.0, 512.0),
                    cpu_cores: ResourceRange::new(1.0, 4.0, 2.0),
                },
                performance: PerformanceProfile {
                    expected_inference_ms: 30.0,
                    memory_footprint_mb: 256.0,
                    throughput_per_sec: 40.0,
                },
                supports_batching: true,
            },
            SimulatedBackendConfig {
                latency_ms: 10,
                ..Default::default()
            },
        )
    }

    /// Generic native backend; accepts any task type.
    pub fn native() -> Self {
        Self::new(
            BackendInfo {
                id: "native".into(),
                name: "Native (simulated)".into(),
                version: "1.0.0".into(),
                kind: BackendKind::Native,
                capabilities: Vec::new(),
                supported_formats: vec![ModelFormat::Native, ModelFormat::CoreMl],
                requirements: BackendRequirements {
                    memory_mb: ResourceRange::new(64.0, 2048.0, 256.0),
                    cpu_cores: ResourceRange::new(1.0, 4.0, 1.0),
                },
                performance: PerformanceProfile {
                    expected_inference_ms: 60.0,
                    memory_footprint_mb: 128.0,
                    throughput_per_sec: 10.0,
                },
                supports_batching: false,
            },
            SimulatedBackendConfig {
                latency_ms: 20,
                ..Default::default()
            },
        )
    }

    /// Same backend under a different id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.info.id = id.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.config.latency_ms = latency.as_millis() as u64;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.info.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_memory(mut self, max_mb: f64) -> Self {
        self.info.requirements.memory_mb.max = max_mb;
        self.info.requirements.memory_mb.optimal = self.info.requirements.memory_mb.optimal.min(max_mb);
        self.info.requirements.memory_mb.min = self.info.requirements.memory_mb.min.min(max_mb);
        self
    }

    pub fn failing_initialize(mut self) -> Self {
        self.config.initialize_ok = false;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail every inference until turned off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next inference with `message`. Calls stack up.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.scripted_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message.into());
    }

    /// Override the status returned by `get_health()`.
    pub fn set_reported_status(&self, status: Option<HealthStatus>) {
        *self
            .reported_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn inference_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of inferences observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn loaded_models(&self) -> Vec<String> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn next_failure(&self) -> Option<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Some("simulated failure".into());
        }
        self.scripted_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Decrements the in-flight counter even when the inference future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceBackend for SimulatedBackend {
    fn info(&self) -> BackendInfo {
        self.info.clone()
    }

    async fn initialize(&self) -> Result<bool, BackendError> {
        debug!(backend_id = %self.info.id, ok = self.config.initialize_ok, "Simulated backend initialize");
        Ok(self.config.initialize_ok)
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get_health(&self) -> Result<BackendHealthReport, BackendError> {
        let reported = *self
            .reported_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let status = match reported {
            Some(status) => status,
            None if self.available.load(Ordering::SeqCst) => HealthStatus::Healthy,
            None => HealthStatus::Unavailable,
        };
        let loaded = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        Ok(BackendHealthReport {
            status,
            active_connections: self.in_flight.load(Ordering::SeqCst) as u32,
            resource_usage: ResourceUsage {
                memory_mb: self.info.performance.memory_footprint_mb * loaded as f64,
                cpu_percent: 0.0,
            },
            message: None,
        })
    }

    async fn load_model(&self, model: &ModelMetadata) -> Result<LoadedModel, BackendError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::BackendUnavailable {
                id: self.info.id.clone(),
            });
        }
        if !self.info.supports_format(model.format) {
            return Err(BackendError::inference(
                &self.info.id,
                format!("format {} not supported", model.format),
            ));
        }
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.id.clone());
        Ok(LoadedModel {
            model_id: model.id.clone(),
            memory_mb: model.expected_memory_mb(),
            loaded_at: Utc::now(),
        })
    }

    async fn unload_model(&self, model_id: &str) -> Result<(), BackendError> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(model_id);
        Ok(())
    }

    async fn list_models(&self) -> Vec<String> {
        self.loaded_models()
    }

    async fn run_inference(
        &self,
        model_id: &str,
        input: &TaskInput,
    ) -> Result<InferenceOutput, BackendError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BackendError::BackendUnavailable {
                id: self.info.id.clone(),
            });
        }
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;

        let failure = self.next_failure();
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.total_inferences += 1;
        let n = metrics.total_inferences as f64;
        metrics.average_inference_ms += (self.config.latency_ms as f64 - metrics.average_inference_ms) / n;
        if let Some(message) = failure {
            metrics.failed_inferences += 1;
            return Err(BackendError::inference(&self.info.id, message));
        }

        Ok(InferenceOutput {
            payload: serde_json::json!({
                "backend": self.info.id,
                "model": model_id,
                "format": input.format,
                "call": call,
            }),
            inference_ms: self.config.latency_ms as f64,
            confidence: Some(self.config.confidence),
        })
    }

    async fn get_performance_metrics(&self) -> BackendPerformanceMetrics {
        let mut metrics = *self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        metrics.loaded_models = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        metrics
    }
}
