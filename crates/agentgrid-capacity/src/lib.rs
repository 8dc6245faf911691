//! agentgrid-capacity — learned overbooking per device class.
//!
//! Every node reports load samples through its heartbeat. Samples are kept
//! per device class, and once enough history has built up the learner
//! nudges the class's overbooking factor up or down.
//!
//! # Adjustment Algorithm
//!
//! ```text
//! gate:   samples >= min_samples_for_adjustment
//!         and (never adjusted or now - last_adjustment >= adjustment_interval)
//!
//! window = last `analysis_window` samples
//!
//! if ratio > 0.80 and cpu < 70 and memory < 70:  factor += 0.1  (cap 2.0)
//! elif ratio < 0.50:                             factor -= 0.1  (floor 1.2)
//! elif cpu > 85 or memory > 85:                  factor -= 0.2  (floor 1.2)
//! elif latency > 1000ms:                         factor -= 0.1  (floor 1.2)
//!
//! siblings (same family prefix): factor = (factor + new) / 2
//! ```
//!
//! Effective node capacity is `floor(max_agents * factor)`.

pub mod config;
pub mod learner;
pub mod rules;

pub use config::LearnerConfig;
pub use learner::{Adjustment, CapacityLearner, DeviceStats};
pub use rules::{AdjustmentReason, WindowStats, family_prefix};
