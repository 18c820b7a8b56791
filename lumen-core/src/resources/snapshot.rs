//! Point-in-time system resource readings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse network availability, as far as the sampler can tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Offline,
    Poor,
    Good,
    Excellent,
    #[default]
    Unknown,
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkQuality::Offline => "offline",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Good => "good",
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A complete reading of the resources the scheduler cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    /// Global CPU utilisation, 0-100.
    pub cpu_usage_percent: f64,
    pub cpu_cores: usize,
    pub total_storage_mb: u64,
    pub available_storage_mb: u64,
    pub network: NetworkQuality,
    pub timestamp: DateTime<Utc>,
    /// `true` when no real sample was available and the values are guessed.
    #[serde(default)]
    pub estimated: bool,
}

impl ResourceSnapshot {
    /// Best-effort reading used before the first successful sample.
    pub fn estimate() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            total_memory_mb: 0,
            available_memory_mb: 0,
            cpu_usage_percent: 0.0,
            cpu_cores,
            total_storage_mb: 0,
            available_storage_mb: 0,
            network: NetworkQuality::Unknown,
            timestamp: Utc::now(),
            estimated: true,
        }
    }

    /// Memory utilisation, 0-100. Zero when total memory is unknown.
    pub fn memory_usage_percent(&self) -> f64 {
        if self.total_memory_mb == 0 {
            return 0.0;
        }
        let used = self.total_memory_mb.saturating_sub(self.available_memory_mb);
        used as f64 / self.total_memory_mb as f64 * 100.0
    }

    /// Storage utilisation, 0-100. Zero when total storage is unknown.
    pub fn storage_usage_percent(&self) -> f64 {
        if self.total_storage_mb == 0 {
            return 0.0;
        }
        let used = self.total_storage_mb.saturating_sub(self.available_storage_mb);
        used as f64 / self.total_storage_mb as f64 * 100.0
    }

    /// One-line summary for logs and CLI output.
    pub fn summary(&self) -> String {
        let source = if self.estimated { " (estimated)" } else { "" };
        format!(
            "CPU {:.0}% ({} cores), Mem {}/{} MB avail ({:.0}% used), \
             Disk {}/{} MB avail, Net {}{source}",
            self.cpu_usage_percent,
            self.cpu_cores,
            self.available_memory_mb,
            self.total_memory_mb,
            self.memory_usage_percent(),
            self.available_storage_mb,
            self.total_storage_mb,
            self.network,
        )
    }
}

/// Averages over the most recent samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceTrend {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub samples: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: u64, avail: u64) -> ResourceSnapshot {
        ResourceSnapshot {
            total_memory_mb: total,
            available_memory_mb: avail,
            cpu_usage_percent: 42.0,
            cpu_cores: 8,
            total_storage_mb: 1000,
            available_storage_mb: 250,
            network: NetworkQuality::Good,
            timestamp: Utc::now(),
            estimated: false,
        }
    }

    #[test]
    fn test_memory_usage_percent() {
        let snap = sample(4000, 1000);
        assert!((snap.memory_usage_percent() - 75.0).abs() < f64::EPSILON);
        assert!((snap.storage_usage_percent() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_total_is_zero_usage() {
        let snap = sample(0, 0);
        assert_eq!(snap.memory_usage_percent(), 0.0);
    }

    #[test]
    fn test_estimate_is_flagged() {
        let snap = ResourceSnapshot::estimate();
        assert!(snap.estimated);
        assert!(snap.cpu_cores >= 1);
        assert!(snap.summary().contains("estimated"));
    }

    #[test]
    fn test_summary_format() {
        let summary = sample(4000, 1000).summary();
        assert!(summary.contains("8 cores"));
        assert!(summary.contains("1000/4000 MB"));
        assert!(summary.contains("Net good"));
    }
}
