//! Auto-scaling evaluation.
//!
//! Decisions are recommendations for the scheduler's concurrency ceiling;
//! applying them is left to the host through `update_config`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScalingThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale_up"),
            ScalingAction::ScaleDown => write!(f, "scale_down"),
            ScalingAction::Maintain => write!(f, "maintain"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMetric {
    Cpu,
    Memory,
    QueueDepth,
}

/// The metric that drove a decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalingTrigger {
    pub metric: ScalingMetric,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<ScalingTrigger>,
    pub current_concurrency: usize,
    pub recommended_concurrency: usize,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
}

/// Inputs to a scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingInputs {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub queue_depth: usize,
    pub current_concurrency: usize,
    pub concurrency_limit: usize,
}

/// Compare load against thresholds. Any metric above its threshold scales up
/// by one; CPU and memory both under half their thresholds with an empty
/// queue scales down by one; anything else maintains.
pub fn evaluate(inputs: &ScalingInputs, thresholds: &ScalingThresholds) -> ScalingDecision {
    let current = inputs.current_concurrency;
    let checks = [
        (ScalingMetric::Cpu, inputs.cpu_percent, thresholds.cpu_threshold),
        (ScalingMetric::Memory, inputs.memory_percent, thresholds.memory_threshold),
        (
            ScalingMetric::QueueDepth,
            inputs.queue_depth as f64,
            thresholds.queue_threshold as f64,
        ),
    ];

    let exceeded = checks
        .iter()
        .find(|(_, value, threshold)| value > threshold)
        .map(|&(metric, value, threshold)| ScalingTrigger {
            metric,
            value,
            threshold,
        });

    let (action, recommended, trigger, reason) = if let Some(trigger) = exceeded {
        let recommended = (current + 1).min(inputs.concurrency_limit.max(current));
        let reason = format!(
            "{:?} at {:.1} exceeds threshold {:.1}",
            trigger.metric, trigger.value, trigger.threshold
        );
        (ScalingAction::ScaleUp, recommended, Some(trigger), reason)
    } else if inputs.cpu_percent < thresholds.cpu_threshold / 2.0
        && inputs.memory_percent < thresholds.memory_threshold / 2.0
        && inputs.queue_depth == 0
    {
        let recommended = current.saturating_sub(1).max(1);
        let trigger = ScalingTrigger {
            metric: ScalingMetric::Cpu,
            value: inputs.cpu_percent,
            threshold: thresholds.cpu_threshold / 2.0,
        };
        let reason = format!(
            "CPU {:.1}% and memory {:.1}% below half their thresholds with an empty queue",
            inputs.cpu_percent, inputs.memory_percent
        );
        (ScalingAction::ScaleDown, recommended, Some(trigger), reason)
    } else {
        (
            ScalingAction::Maintain,
            current,
            None,
            "load within thresholds".to_string(),
        )
    };

    ScalingDecision {
        action,
        trigger,
        current_concurrency: current,
        recommended_concurrency: recommended,
        reason,
        evaluated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(cpu: f64, mem: f64, queue: usize) -> ScalingInputs {
        ScalingInputs {
            cpu_percent: cpu,
            memory_percent: mem,
            queue_depth: queue,
            current_concurrency: 4,
            concurrency_limit: 5,
        }
    }

    #[test]
    fn test_high_load_scales_up() {
        let decision = evaluate(&inputs(95.0, 90.0, 20), &ScalingThresholds::default());
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.recommended_concurrency, 5);
        assert_eq!(decision.trigger.unwrap().metric, ScalingMetric::Cpu);
    }

    #[test]
    fn test_scale_up_capped_at_limit() {
        let mut i = inputs(10.0, 10.0, 50);
        i.current_concurrency = 5;
        let decision = evaluate(&i, &ScalingThresholds::default());
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.recommended_concurrency, 5);
        assert_eq!(decision.trigger.unwrap().metric, ScalingMetric::QueueDepth);
    }

    #[test]
    fn test_low_load_scales_down() {
        let decision = evaluate(&inputs(5.0, 10.0, 0), &ScalingThresholds::default());
        assert_eq!(decision.action, ScalingAction::ScaleDown);
        assert_eq!(decision.recommended_concurrency, 3);
    }

    #[test]
    fn test_scale_down_floor_is_one() {
        let mut i = inputs(5.0, 10.0, 0);
        i.current_concurrency = 1;
        assert_eq!(
            evaluate(&i, &ScalingThresholds::default()).recommended_concurrency,
            1
        );
    }

    #[test]
    fn test_moderate_load_maintains() {
        let decision = evaluate(&inputs(60.0, 50.0, 2), &ScalingThresholds::default());
        assert_eq!(decision.action, ScalingAction::Maintain);
        assert_eq!(decision.recommended_concurrency, 4);
        assert!(decision.trigger.is_none());
        assert_eq!(decision.action.to_string(), "maintain");
    }
}
