//! Learner tuning knobs.

use std::time::Duration;

/// Configuration for [`CapacityLearner`](crate::CapacityLearner).
#[derive(Debug, Clone, PartialEq)]
pub struct LearnerConfig {
    /// Samples a profile needs before it may be adjusted.
    pub min_samples_for_adjustment: usize,
    /// Minimum time between two adjustments of one profile.
    pub adjustment_interval: Duration,
    /// Samples retained per profile; oldest are dropped first.
    pub max_samples: usize,
    /// Most recent samples considered by the adjustment rules.
    pub analysis_window: usize,
    /// Most recent samples averaged in `get_stats`.
    pub stats_window: usize,
    pub default_factor: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            min_samples_for_adjustment: 100,
            adjustment_interval: Duration::from_secs(24 * 60 * 60),
            max_samples: 1000,
            analysis_window: 500,
            stats_window: 100,
            default_factor: 1.5,
            min_factor: 1.2,
            max_factor: 2.0,
        }
    }
}

impl LearnerConfig {
    /// Clamp a factor into `[min_factor, max_factor]`.
    pub fn clamp(&self, factor: f64) -> f64 {
        factor.clamp(self.min_factor, self.max_factor)
    }
}
