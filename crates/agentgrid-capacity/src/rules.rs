//! Adjustment rules over a window of load samples.

use std::fmt;

use serde::{Deserialize, Serialize};

use agentgrid_state::LoadSample;

const HIGH_RATIO: f64 = 0.80;
const LOW_RATIO: f64 = 0.50;
const HEADROOM_PERCENT: f64 = 70.0;
const SATURATED_PERCENT: f64 = 85.0;
const HIGH_LATENCY_MS: f64 = 1000.0;

/// Averages over a window of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub samples: usize,
    pub avg_active_ratio: f64,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    /// Mean over samples with a measured latency; 0 when none were measured.
    pub avg_latency_ms: f64,
}

impl WindowStats {
    /// Average the given samples. An empty window yields all zeros.
    pub fn over<'a>(samples: impl IntoIterator<Item = &'a LoadSample>) -> Self {
        let mut stats = Self::default();
        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;

        for sample in samples {
            stats.samples += 1;
            stats.avg_active_ratio += sample.active_ratio();
            stats.avg_cpu_percent += sample.cpu_percent;
            stats.avg_memory_percent += sample.memory_percent;
            if sample.latency_ms > 0.0 {
                latency_sum += sample.latency_ms;
                latency_count += 1;
            }
        }

        if stats.samples > 0 {
            let n = stats.samples as f64;
            stats.avg_active_ratio /= n;
            stats.avg_cpu_percent /= n;
            stats.avg_memory_percent /= n;
        }
        if latency_count > 0 {
            stats.avg_latency_ms = latency_sum / latency_count as f64;
        }
        stats
    }
}

/// Why a profile's factor moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    HighUtilization,
    LowUtilization,
    ResourcesSaturated,
    HighLatency,
}

impl AdjustmentReason {
    /// Signed change applied to the factor before clamping.
    pub fn delta(self) -> f64 {
        match self {
            Self::HighUtilization => 0.1,
            Self::LowUtilization => -0.1,
            Self::ResourcesSaturated => -0.2,
            Self::HighLatency => -0.1,
        }
    }

    /// First matching rule for the window, in priority order.
    pub fn evaluate(stats: &WindowStats) -> Option<Self> {
        if stats.avg_active_ratio > HIGH_RATIO
            && stats.avg_cpu_percent < HEADROOM_PERCENT
            && stats.avg_memory_percent < HEADROOM_PERCENT
        {
            Some(Self::HighUtilization)
        } else if stats.avg_active_ratio < LOW_RATIO {
            Some(Self::LowUtilization)
        } else if stats.avg_cpu_percent > SATURATED_PERCENT
            || stats.avg_memory_percent > SATURATED_PERCENT
        {
            Some(Self::ResourcesSaturated)
        } else if stats.avg_latency_ms > HIGH_LATENCY_MS {
            Some(Self::HighLatency)
        } else {
            None
        }
    }
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HighUtilization => "high utilization, resources available",
            Self::LowUtilization => "low utilization",
            Self::ResourcesSaturated => "resources saturated",
            Self::HighLatency => "high latency",
        })
    }
}

/// Hardware family of a device type: the text before the first `_` or `-`.
///
/// `rpi4_a` and `rpi4-b` both belong to `rpi4`; a type without a separator
/// is its own family.
pub fn family_prefix(device_type: &str) -> &str {
    device_type
        .split(['_', '-'])
        .next()
        .unwrap_or(device_type)
}
