//! Configuration system for Lumen.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/lumen/config.toml` and/or `.lumen/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration for the inference core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LumenConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub health: HealthMonitorConfig,
    #[serde(default)]
    pub resources: ResourceMonitorConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl LumenConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.health.validate()?;
        self.resources.validate()
    }
}

/// How the backend manager weighs candidates when several can run a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Prefer the backend with the fewest active task claims.
    #[default]
    LeastLoaded,
    /// Rotate through eligible backends.
    RoundRobin,
    /// Prefer the best historical success rate and latency.
    Performance,
    /// Prefer the most free declared capacity.
    ResourceAware,
}

/// Queue ordering policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    /// Priority weight plus aging boost.
    #[default]
    Weighted,
    /// Priority weight only, no aging.
    Strict,
    /// Submission order only.
    Fifo,
}

/// Auto-scaling trigger thresholds. CPU and memory are percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingThresholds {
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: usize,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            queue_threshold: default_queue_threshold(),
        }
    }
}

fn default_cpu_threshold() -> f64 {
    80.0
}

fn default_memory_threshold() -> f64 {
    85.0
}

fn default_queue_threshold() -> usize {
    10
}

/// Task queue behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_size")]
    pub max_size: usize,
    #[serde(default = "default_true")]
    pub priority_aging_enabled: bool,
    /// Milliseconds a task must wait to gain one priority level.
    #[serde(default = "default_aging_interval_ms")]
    pub aging_interval_ms: u64,
    #[serde(default = "default_true")]
    pub fair_share_enabled: bool,
    /// Consecutive dispatch slots one task type or submitter may take while
    /// other work is waiting.
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive_dispatches: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_size(),
            priority_aging_enabled: true,
            aging_interval_ms: default_aging_interval_ms(),
            fair_share_enabled: true,
            max_consecutive_dispatches: default_max_consecutive(),
        }
    }
}

impl QueueConfig {
    pub fn aging_interval(&self) -> Duration {
        Duration::from_millis(self.aging_interval_ms)
    }
}

fn default_queue_size() -> usize {
    1000
}

fn default_aging_interval_ms() -> u64 {
    5_000
}

fn default_max_consecutive() -> u32 {
    3
}

/// Task scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_queue_size")]
    pub max_queue_size: usize,
    /// Wall-clock limit for a running task, measured from dispatch.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub load_balancing_strategy: LoadBalancingStrategy,
    #[serde(default)]
    pub priority_mode: PriorityMode,
    /// Cadence of periodic auto-scaling evaluation.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub auto_scaling: bool,
    #[serde(default)]
    pub scaling_thresholds: ScalingThresholds,
    #[serde(default)]
    pub queue_config: QueueConfig,
    /// Upper bound for scale-up recommendations.
    #[serde(default = "default_max_concurrency_limit")]
    pub max_concurrency_limit: usize,
    /// Fallback wake-up tick of the dispatch loop, so aging is re-evaluated
    /// even without new submissions.
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            max_queue_size: default_queue_size(),
            task_timeout_ms: default_task_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            load_balancing_strategy: LoadBalancingStrategy::default(),
            priority_mode: PriorityMode::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            auto_scaling: true,
            scaling_thresholds: ScalingThresholds::default(),
            queue_config: QueueConfig::default(),
            max_concurrency_limit: default_max_concurrency_limit(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

fn default_max_concurrency_limit() -> usize {
    16
}

fn default_dispatch_interval_ms() -> u64 {
    250
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    /// Queue capacity after combining both size limits.
    pub fn effective_queue_size(&self) -> usize {
        self.max_queue_size.min(self.queue_config.max_size)
    }

    /// Reject values that would corrupt scheduler state.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_tasks",
                "must be at least 1",
            ));
        }
        if self.max_concurrency_limit < self.max_concurrent_tasks {
            return Err(ConfigError::invalid(
                "max_concurrency_limit",
                format!(
                    "{} is below max_concurrent_tasks ({})",
                    self.max_concurrency_limit, self.max_concurrent_tasks
                ),
            ));
        }
        if self.max_queue_size == 0 || self.queue_config.max_size == 0 {
            return Err(ConfigError::invalid("max_queue_size", "must be at least 1"));
        }
        if self.task_timeout_ms == 0 {
            return Err(ConfigError::invalid("task_timeout", "must be positive"));
        }
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "health_check_interval",
                "must be positive",
            ));
        }
        if self.dispatch_interval_ms == 0 {
            return Err(ConfigError::invalid("dispatch_interval", "must be positive"));
        }
        if self.queue_config.aging_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "queue_config.aging_interval",
                "must be positive",
            ));
        }
        if self.queue_config.max_consecutive_dispatches == 0 {
            return Err(ConfigError::invalid(
                "queue_config.max_consecutive_dispatches",
                "must be at least 1",
            ));
        }
        let t = &self.scaling_thresholds;
        for (field, value) in [
            ("scaling_thresholds.cpu_threshold", t.cpu_threshold),
            ("scaling_thresholds.memory_threshold", t.memory_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 100.0 {
                return Err(ConfigError::invalid(
                    field,
                    format!("{value} is outside (0, 100]"),
                ));
            }
        }
        Ok(())
    }

    /// Apply a partial update, returning the merged config. Validation is
    /// left to the caller so the update can be rejected as a whole.
    pub fn merged(&self, update: &SchedulerConfigUpdate) -> Self {
        let mut next = *self;
        if let Some(v) = update.max_concurrent_tasks {
            next.max_concurrent_tasks = v;
        }
        if let Some(v) = update.max_queue_size {
            next.max_queue_size = v;
        }
        if let Some(v) = update.task_timeout_ms {
            next.task_timeout_ms = v;
        }
        if let Some(v) = update.retry_attempts {
            next.retry_attempts = v;
        }
        if let Some(v) = update.load_balancing_strategy {
            next.load_balancing_strategy = v;
        }
        if let Some(v) = update.priority_mode {
            next.priority_mode = v;
        }
        if let Some(v) = update.health_check_interval_ms {
            next.health_check_interval_ms = v;
        }
        if let Some(v) = update.auto_scaling {
            next.auto_scaling = v;
        }
        if let Some(v) = update.scaling_thresholds {
            next.scaling_thresholds = v;
        }
        if let Some(v) = update.queue_config {
            next.queue_config = v;
        }
        if let Some(v) = update.max_concurrency_limit {
            next.max_concurrency_limit = v;
        }
        next
    }
}

/// Partial scheduler configuration accepted by `TaskScheduler::update_config`.
/// Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_strategy: Option<LoadBalancingStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_mode: Option<PriorityMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scaling: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_thresholds: Option<ScalingThresholds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_config: Option<QueueConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency_limit: Option<usize>,
}

impl SchedulerConfigUpdate {
    /// Parse an update sent by the host application as JSON.
    ///
    /// Malformed input such as a negative concurrency value is reported as an
    /// `InvalidConfiguration` error instead of reaching the scheduler.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::invalid("update", e.to_string()))
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    /// Probe cadence per backend.
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive failed checks that move a backend one step down.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successful checks that move a backend one step up.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Check results retained per backend.
    #[serde(default = "default_check_history")]
    pub history_size: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            probe_timeout_ms: default_probe_timeout_ms(),
            history_size: default_check_history(),
        }
    }
}

impl HealthMonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid("health.interval", "must be positive"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "health.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.recovery_threshold == 0 {
            return Err(ConfigError::invalid(
                "health.recovery_threshold",
                "must be at least 1",
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "health.probe_timeout",
                "must be positive",
            ));
        }
        Ok(())
    }
}

fn default_health_interval_ms() -> u64 {
    15_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_threshold() -> u32 {
    2
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_check_history() -> usize {
    50
}

/// Resource monitor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Samples retained for trend checks.
    #[serde(default = "default_resource_history")]
    pub history_size: usize,
    /// Samples averaged when evaluating auto-scaling.
    #[serde(default = "default_trend_window")]
    pub trend_window: usize,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            history_size: default_resource_history(),
            trend_window: default_trend_window(),
        }
    }
}

impl ResourceMonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "resources.poll_interval",
                "must be positive",
            ));
        }
        if self.history_size == 0 {
            return Err(ConfigError::invalid(
                "resources.history_size",
                "must be at least 1",
            ));
        }
        if self.trend_window == 0 {
            return Err(ConfigError::invalid(
                "resources.trend_window",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_resource_history() -> usize {
    120
}

fn default_trend_window() -> usize {
    5
}

/// Model catalog persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// JSON file the catalog is exported to and imported from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `LUMEN_`)
/// 3. Workspace-local config (`.lumen/config.toml`)
/// 4. User config (`~/.config/lumen/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&LumenConfig>,
) -> Result<LumenConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(LumenConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "lumen", "lumen") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // LUMEN_SCHEDULER__MAX_CONCURRENT_TASKS, LUMEN_HEALTH__INTERVAL_MS, etc.
    figment = figment.merge(Env::prefixed("LUMEN_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: LumenConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".lumen").join("config.toml")
}

/// Write `config` to the workspace config file, creating `.lumen/` if needed.
pub fn save_workspace_config(workspace: &Path, config: &LumenConfig) -> Result<PathBuf, ConfigError> {
    let path = workspace_config_path(workspace);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::ParseError {
            message: format!("cannot create {}: {e}", dir.display()),
        })?;
    }
    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    std::fs::write(&path, content).map_err(|e| ConfigError::ParseError {
        message: format!("cannot write {}: {e}", path.display()),
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LumenConfig::default();
        assert_eq!(config.scheduler.max_concurrent_tasks, 4);
        assert_eq!(config.scheduler.retry_attempts, 2);
        assert_eq!(
            config.scheduler.load_balancing_strategy,
            LoadBalancingStrategy::LeastLoaded
        );
        assert_eq!(config.scheduler.priority_mode, PriorityMode::Weighted);
        assert!(config.scheduler.queue_config.priority_aging_enabled);
        assert_eq!(config.health.failure_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = LumenConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LumenConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.scheduler, config.scheduler);
        assert_eq!(parsed.health, config.health);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: LumenConfig = toml::from_str(
            r#"
            [scheduler]
            max_concurrent_tasks = 8
            priority_mode = "fifo"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.scheduler.max_concurrent_tasks, 8);
        assert_eq!(parsed.scheduler.priority_mode, PriorityMode::Fifo);
        assert_eq!(parsed.scheduler.max_queue_size, 1000);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = SchedulerConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_tasks"));
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let config = SchedulerConfig {
            scaling_thresholds: ScalingThresholds {
                cpu_threshold: 150.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merged_only_touches_set_fields() {
        let base = SchedulerConfig::default();
        let update = SchedulerConfigUpdate {
            max_concurrent_tasks: Some(2),
            ..Default::default()
        };
        let merged = base.merged(&update);
        assert_eq!(merged.max_concurrent_tasks, 2);
        assert_eq!(merged.task_timeout_ms, base.task_timeout_ms);
    }

    #[test]
    fn test_update_from_json_rejects_negative() {
        let result =
            SchedulerConfigUpdate::from_json(serde_json::json!({"max_concurrent_tasks": -1}));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LumenConfig::default();
        config.scheduler.max_concurrent_tasks = 6;
        config.health.failure_threshold = 5;
        save_workspace_config(dir.path(), &config).unwrap();

        let loaded = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(loaded.scheduler.max_concurrent_tasks, 6);
        assert_eq!(loaded.health.failure_threshold, 5);
    }
}
