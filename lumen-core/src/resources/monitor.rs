//! Resource monitor: periodic system sampling with bounded history.
//!
//! Sampling runs on a background tokio task owned by the monitor and is
//! cancelled through a `CancellationToken` on `stop()`. The blocking sampler
//! call itself is moved to the blocking pool so the event loop never stalls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use sysinfo::{Disks, Networks, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::snapshot::{NetworkQuality, ResourceSnapshot, ResourceTrend};
use crate::config::ResourceMonitorConfig;

/// A failed resource sample.
#[derive(Debug, thiserror::Error)]
#[error("resource sampling failed: {0}")]
pub struct SampleError(pub String);

/// Source of resource readings.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Result<ResourceSnapshot, SampleError>;
}

/// Samples the host with `sysinfo`.
pub struct SystemSampler {
    system: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> Result<ResourceSnapshot, SampleError> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total_memory_mb = self.system.total_memory() / 1024 / 1024;
        if total_memory_mb == 0 {
            return Err(SampleError("memory information unavailable".into()));
        }
        let available_memory_mb = self.system.available_memory() / 1024 / 1024;

        let disks = Disks::new_with_refreshed_list();
        let (total_storage, available_storage) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(t, a), d| {
                (t + d.total_space(), a + d.available_space())
            });

        let networks = Networks::new_with_refreshed_list();
        let external: Vec<_> = networks
            .list()
            .iter()
            .filter(|(name, _)| !name.starts_with("lo"))
            .collect();
        let network = if networks.list().is_empty() {
            NetworkQuality::Unknown
        } else if external.is_empty() {
            NetworkQuality::Offline
        } else if external.iter().any(|(_, data)| data.total_received() > 0) {
            NetworkQuality::Good
        } else {
            NetworkQuality::Poor
        };

        Ok(ResourceSnapshot {
            total_memory_mb,
            available_memory_mb,
            cpu_usage_percent: f64::from(self.system.global_cpu_usage()),
            cpu_cores: self.system.cpus().len().max(1),
            total_storage_mb: total_storage / 1024 / 1024,
            available_storage_mb: available_storage / 1024 / 1024,
            network,
            timestamp: Utc::now(),
            estimated: false,
        })
    }
}

#[derive(Default)]
struct MonitorState {
    current: Option<ResourceSnapshot>,
    history: VecDeque<ResourceSnapshot>,
    failed_samples: u64,
}

struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

type SharedSampler = Arc<Mutex<Box<dyn ResourceSampler>>>;

/// Samples system resources on a timer and keeps a bounded history.
pub struct ResourceMonitor {
    config: ResourceMonitorConfig,
    sampler: SharedSampler,
    state: Arc<RwLock<MonitorState>>,
    poller: Mutex<Option<Poller>>,
    initialized: AtomicBool,
}

impl ResourceMonitor {
    /// Monitor backed by the host system.
    pub fn new(config: ResourceMonitorConfig) -> Self {
        Self::with_sampler(config, Box::new(SystemSampler::new()))
    }

    /// Monitor backed by a custom sampler.
    pub fn with_sampler(config: ResourceMonitorConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        Self {
            config,
            sampler: Arc::new(Mutex::new(sampler)),
            state: Arc::new(RwLock::new(MonitorState::default())),
            poller: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Take a first sample and start polling. Calling it again is a no-op.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sample_now().await;
        self.start();
        info!(
            interval_ms = self.config.poll_interval_ms,
            "Resource monitor initialized"
        );
    }

    /// Start the polling loop if it is not already running.
    pub fn start(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let sampler = self.sampler.clone();
        let state = self.state.clone();
        let config = self.config;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; initialize() already sampled.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => {
                        debug!("Resource polling cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        run_sample(&sampler, &state, config.history_size).await;
                    }
                }
            }
        });

        *poller = Some(Poller { token, handle });
    }

    /// Stop polling. Collected state is kept.
    pub async fn stop(&self) {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            poller.token.cancel();
            let _ = poller.handle.await;
            debug!("Resource monitor stopped");
        }
    }

    /// Stop polling and allow a later `initialize()` to start over.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Whether the polling loop is running.
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Take a sample immediately. Returns `None` if sampling failed.
    pub async fn sample_now(&self) -> Option<ResourceSnapshot> {
        run_sample(&self.sampler, &self.state, self.config.history_size).await
    }

    /// Most recent reading, or an estimate when nothing has been sampled yet.
    pub fn get_current_resources(&self) -> ResourceSnapshot {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
            .unwrap_or_else(ResourceSnapshot::estimate)
    }

    /// Copy of the retained samples, oldest first.
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Average CPU and memory utilisation over the last `n` samples.
    pub fn recent_average(&self, n: usize) -> Option<ResourceTrend> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let window: Vec<&ResourceSnapshot> = state.history.iter().rev().take(n.max(1)).collect();
        if window.is_empty() {
            return None;
        }
        let count = window.len() as f64;
        Some(ResourceTrend {
            cpu_percent: window.iter().map(|s| s.cpu_usage_percent).sum::<f64>() / count,
            memory_percent: window.iter().map(|s| s.memory_usage_percent()).sum::<f64>() / count,
            samples: window.len(),
        })
    }

    /// Trend over the configured window.
    pub fn trend(&self) -> Option<ResourceTrend> {
        self.recent_average(self.config.trend_window)
    }

    /// Number of samples that failed since the monitor was created.
    pub fn failed_samples(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .failed_samples
    }

    pub fn config(&self) -> &ResourceMonitorConfig {
        &self.config
    }
}

async fn run_sample(
    sampler: &SharedSampler,
    state: &Arc<RwLock<MonitorState>>,
    history_size: usize,
) -> Option<ResourceSnapshot> {
    let sampler = sampler.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sample()
    })
    .await;

    let mut state = state.write().unwrap_or_else(PoisonError::into_inner);
    match outcome {
        Ok(Ok(snapshot)) => {
            state.history.push_back(snapshot.clone());
            while state.history.len() > history_size {
                state.history.pop_front();
            }
            state.current = Some(snapshot.clone());
            Some(snapshot)
        }
        Ok(Err(e)) => {
            state.failed_samples += 1;
            warn!(error = %e, "Skipping failed resource sample");
            None
        }
        Err(e) => {
            state.failed_samples += 1;
            warn!(error = %e, "Resource sampler panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Returns CPU readings from a script; a `None` entry simulates a failure.
    struct ScriptedSampler {
        readings: Vec<Option<f64>>,
        calls: Arc<AtomicUsize>,
    }

    impl ResourceSampler for ScriptedSampler {
        fn sample(&mut self) -> Result<ResourceSnapshot, SampleError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let reading = self.readings.get(i).copied().flatten();
            match reading {
                Some(cpu) => Ok(ResourceSnapshot {
                    total_memory_mb: 1000,
                    available_memory_mb: 500,
                    cpu_usage_percent: cpu,
                    cpu_cores: 4,
                    total_storage_mb: 0,
                    available_storage_mb: 0,
                    network: NetworkQuality::Good,
                    timestamp: Utc::now(),
                    estimated: false,
                }),
                None => Err(SampleError("scripted failure".into())),
            }
        }
    }

    fn monitor(readings: Vec<Option<f64>>, history: usize) -> (ResourceMonitor, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ResourceMonitorConfig {
            poll_interval_ms: 10,
            history_size: history,
            trend_window: 2,
        };
        let sampler = ScriptedSampler {
            readings,
            calls: calls.clone(),
        };
        (ResourceMonitor::with_sampler(config, Box::new(sampler)), calls)
    }

    #[test]
    fn test_current_before_sampling_is_estimate() {
        let (monitor, _) = monitor(vec![], 4);
        assert!(monitor.get_current_resources().estimated);
        assert!(monitor.recent_average(3).is_none());
    }

    #[tokio::test]
    async fn test_failed_sample_is_skipped() {
        let (monitor, _) = monitor(vec![Some(10.0), None, Some(30.0)], 4);
        assert!(monitor.sample_now().await.is_some());
        assert!(monitor.sample_now().await.is_none());
        assert!(monitor.sample_now().await.is_some());
        assert_eq!(monitor.history().len(), 2);
        assert_eq!(monitor.failed_samples(), 1);
        assert_eq!(monitor.get_current_resources().cpu_usage_percent, 30.0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let readings = (0..6).map(|i| Some(i as f64)).collect();
        let (monitor, _) = monitor(readings, 3);
        for _ in 0..6 {
            monitor.sample_now().await;
        }
        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].cpu_usage_percent, 3.0);
        let trend = monitor.trend().unwrap();
        assert_eq!(trend.samples, 2);
        assert!((trend.cpu_percent - 4.5).abs() < f64::EPSILON);
        assert!((trend.memory_percent - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_polling_start_stop() {
        let readings = vec![Some(5.0); 1000];
        let (monitor, calls) = monitor(readings, 10);
        monitor.initialize().await;
        assert!(monitor.is_polling());
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        monitor.stop().await;
        assert!(!monitor.is_polling());

        let after_stop = calls.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected polling samples, got {after_stop}");
        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);

        // State survives a stop, and polling can resume.
        assert!(!monitor.history().is_empty());
        monitor.start();
        assert!(monitor.is_polling());
        monitor.shutdown().await;
    }
}
