use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Running inference statistics for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_inferences: u64,
    pub successful_inferences: u64,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
    pub success_rate: f64,
    pub error_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl UsageStats {
    /// Fold one inference into the running totals.
    pub fn record(&mut self, duration_ms: f64, success: bool) {
        self.total_inferences += 1;
        if success {
            self.successful_inferences += 1;
        } else {
            self.error_count += 1;
        }
        self.total_time_ms += duration_ms;
        self.average_time_ms = self.total_time_ms / self.total_inferences as f64;
        self.success_rate = self.successful_inferences as f64 / self.total_inferences as f64;
        self.last_used_at = Some(Utc::now());
    }
}
