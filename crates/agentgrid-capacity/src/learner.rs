//! Capacity learner — per-device-class overbooking factors.
//!
//! The learner owns one table of [`ProfileRecord`]s keyed by device type,
//! guarded by a mutex. Each mutation snapshots the table under the lock and
//! persists it after the lock is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use agentgrid_state::{
    Clock, DeviceProfile, LoadSample, MemoryBackend, Persister, ProfileRecord, SystemClock,
    TableBackend,
};

use crate::config::LearnerConfig;
use crate::rules::{AdjustmentReason, WindowStats, family_prefix};

type Table = BTreeMap<String, ProfileRecord>;

/// A factor change made by [`CapacityLearner::record_sample`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub device_type: String,
    pub old_factor: f64,
    pub new_factor: f64,
    pub reason: AdjustmentReason,
    /// Sibling device types nudged toward the new factor.
    pub propagated_to: Vec<String>,
}

/// Summary of one profile, as reported by [`CapacityLearner::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub overbooking_factor: f64,
    pub samples_count: usize,
    pub adjustments_count: u32,
    pub avg_active_ratio: f64,
    pub avg_cpu_percent: f64,
    pub last_adjustment: Option<u64>,
}

/// Learns overbooking factors from node load samples.
pub struct CapacityLearner {
    table: Mutex<Table>,
    persister: Persister<ProfileRecord>,
    clock: Arc<dyn Clock>,
    config: LearnerConfig,
}

impl CapacityLearner {
    /// Open the learner, loading persisted profiles.
    ///
    /// Persisted factors outside the configured bounds are clamped and
    /// sample histories longer than `max_samples` are trimmed.
    pub fn open(
        backend: Arc<dyn TableBackend<ProfileRecord>>,
        clock: Arc<dyn Clock>,
        config: LearnerConfig,
    ) -> Self {
        let persister = Persister::new(backend);
        let mut table = persister.load();

        for record in table.values_mut() {
            record.overbooking_factor = config.clamp(record.overbooking_factor);
            while record.samples.len() > config.max_samples {
                record.samples.pop_front();
            }
        }

        info!(
            backend = %persister.describe(),
            profiles = table.len(),
            "capacity learner opened"
        );

        Self {
            table: Mutex::new(table),
            persister,
            clock,
            config,
        }
    }

    /// An ephemeral learner with default tuning (for testing).
    pub fn in_memory() -> Self {
        Self::open(
            Arc::new(MemoryBackend::<ProfileRecord>::new()),
            Arc::new(SystemClock),
            LearnerConfig::default(),
        )
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Table) -> (T, bool)) -> T {
        let (result, pending) = {
            let mut table = self.lock();
            let (result, changed) = f(&mut table);
            let pending = changed.then(|| (self.persister.next_generation(), table.clone()));
            (result, pending)
        };
        if let Some((generation, snapshot)) = pending {
            self.persister.write(generation, &snapshot);
        }
        result
    }

    /// Current factor for `device_type`, creating a default profile if unseen.
    pub fn get_factor(&self, device_type: &str) -> f64 {
        let default_factor = self.config.default_factor;
        self.mutate(|table| match table.get(device_type) {
            Some(record) => (record.overbooking_factor, false),
            None => {
                debug!(%device_type, factor = default_factor, "new device profile");
                table.insert(
                    device_type.to_string(),
                    ProfileRecord::with_factor(default_factor),
                );
                (default_factor, true)
            }
        })
    }

    /// Raw declared capacity scaled by the learned factor, rounded down.
    pub fn effective_capacity(&self, device_type: &str, raw_max_agents: u32) -> u32 {
        let factor = self.get_factor(device_type);
        (f64::from(raw_max_agents) * factor).floor() as u32
    }

    /// Full profile for inspection; `None` if the class was never seen.
    pub fn get_profile(&self, device_type: &str) -> Option<DeviceProfile> {
        self.lock()
            .get(device_type)
            .map(|record| DeviceProfile::from_record(device_type, record))
    }

    /// Append a load sample and adjust the factor if one is due.
    pub fn record_sample(
        &self,
        device_type: &str,
        agents_registered: u32,
        agents_active: u32,
        cpu_percent: f64,
        memory_percent: f64,
        latency_ms: f64,
    ) -> Option<Adjustment> {
        let now = self.clock.now_secs();
        let sample = LoadSample {
            timestamp: now,
            agents_registered,
            agents_active,
            cpu_percent,
            memory_percent,
            latency_ms,
        };

        let adjustment = self.mutate(|table| {
            let record = table
                .entry(device_type.to_string())
                .or_insert_with(|| ProfileRecord::with_factor(self.config.default_factor));
            record.samples.push_back(sample);
            while record.samples.len() > self.config.max_samples {
                record.samples.pop_front();
            }

            let adjustment = self.evaluate(device_type, record, now).map(|adjustment| {
                let propagated_to = propagate(table, device_type, adjustment.new_factor);
                Adjustment {
                    propagated_to,
                    ..adjustment
                }
            });
            (adjustment, true)
        });

        if let Some(adj) = &adjustment {
            info!(
                %device_type,
                old_factor = adj.old_factor,
                new_factor = adj.new_factor,
                reason = %adj.reason,
                propagated = adj.propagated_to.len(),
                "overbooking factor adjusted"
            );
        }
        adjustment
    }

    /// Apply the first matching rule to `record` if the gate is open.
    fn evaluate(&self, device_type: &str, record: &mut ProfileRecord, now: u64) -> Option<Adjustment> {
        if record.samples.len() < self.config.min_samples_for_adjustment {
            return None;
        }
        if let Some(last) = record.last_adjustment
            && now.saturating_sub(last) < self.config.adjustment_interval.as_secs()
        {
            return None;
        }

        let window = record.samples.len().min(self.config.analysis_window);
        let skip = record.samples.len() - window;
        let stats = WindowStats::over(record.samples.iter().skip(skip));
        let reason = AdjustmentReason::evaluate(&stats)?;

        let old_factor = record.overbooking_factor;
        let new_factor = self.config.clamp(old_factor + reason.delta());
        if (new_factor - old_factor).abs() < 1e-9 {
            debug!(
                %device_type,
                factor = old_factor,
                %reason,
                "factor already at bound"
            );
            return None;
        }

        record.overbooking_factor = new_factor;
        record.adjustments_count += 1;
        record.last_adjustment = Some(now);

        Some(Adjustment {
            device_type: device_type.to_string(),
            old_factor,
            new_factor,
            reason,
            propagated_to: Vec::new(),
        })
    }

    /// Per-profile summary over the last `stats_window` samples.
    pub fn get_stats(&self) -> BTreeMap<String, DeviceStats> {
        let stats_window = self.config.stats_window;
        self.lock()
            .iter()
            .map(|(device_type, record)| {
                let skip = record.samples.len().saturating_sub(stats_window);
                let window = WindowStats::over(record.samples.iter().skip(skip));
                let stats = DeviceStats {
                    overbooking_factor: record.overbooking_factor,
                    samples_count: record.samples.len(),
                    adjustments_count: record.adjustments_count,
                    avg_active_ratio: window.avg_active_ratio,
                    avg_cpu_percent: window.avg_cpu_percent,
                    last_adjustment: record.last_adjustment,
                };
                (device_type.clone(), stats)
            })
            .collect()
    }
}

/// Nudge every sibling of `source` halfway toward `new_factor`.
fn propagate(table: &mut Table, source: &str, new_factor: f64) -> Vec<String> {
    let prefix = family_prefix(source);
    let mut touched = Vec::new();
    for (device_type, record) in table.iter_mut() {
        if device_type == source || !device_type.starts_with(prefix) {
            continue;
        }
        let before = record.overbooking_factor;
        record.overbooking_factor = (before + new_factor) / 2.0;
        debug!(
            %device_type,
            %source,
            before,
            after = record.overbooking_factor,
            "factor propagated"
        );
        touched.push(device_type.clone());
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgrid_state::{JsonFileBackend, ManualClock};
    use std::time::Duration;

    const DAY: u64 = 24 * 60 * 60;

    fn learner(clock: Arc<ManualClock>) -> CapacityLearner {
        CapacityLearner::open(
            Arc::new(MemoryBackend::<ProfileRecord>::new()),
            clock,
            LearnerConfig::default(),
        )
    }

    /// `n` samples with 20 registered agents, `active` of them active.
    fn feed(learner: &CapacityLearner, device: &str, n: usize, active: u32, cpu: f64, mem: f64) -> Vec<Adjustment> {
        (0..n)
            .filter_map(|_| learner.record_sample(device, 20, active, cpu, mem, 0.0))
            .collect()
    }

    #[test]
    fn unseen_device_gets_default_factor() {
        let learner = learner(Arc::new(ManualClock::new(0)));
        assert!(learner.get_profile("rpi4").is_none());
        assert_eq!(learner.get_factor("rpi4"), 1.5);
        let profile = learner.get_profile("rpi4").unwrap();
        assert_eq!(profile.overbooking_factor, 1.5);
        assert!(profile.samples.is_empty());
    }

    #[test]
    fn high_utilization_raises_factor() {
        let clock = Arc::new(ManualClock::new(10_000));
        let learner = learner(clock.clone());
        learner.get_factor("rpi4");

        // 17/20 = 0.85 active, cpu and memory at 50%.
        let adjustments = feed(&learner, "rpi4", 150, 17, 50.0, 50.0);

        assert_eq!(adjustments.len(), 1);
        let adj = &adjustments[0];
        assert_eq!(adj.reason, AdjustmentReason::HighUtilization);
        assert!((adj.new_factor - 1.6).abs() < 1e-9);

        let profile = learner.get_profile("rpi4").unwrap();
        assert!((profile.overbooking_factor - 1.6).abs() < 1e-9);
        assert_eq!(profile.adjustments_count, 1);
        assert_eq!(profile.last_adjustment, Some(10_000));
        assert_eq!(profile.samples.len(), 150);
    }

    #[test]
    fn no_adjustment_before_min_samples() {
        let learner = learner(Arc::new(ManualClock::new(0)));
        assert!(feed(&learner, "rpi4", 99, 17, 50.0, 50.0).is_empty());
        assert_eq!(learner.get_factor("rpi4"), 1.5);
        assert_eq!(feed(&learner, "rpi4", 1, 17, 50.0, 50.0).len(), 1);
    }

    #[test]
    fn interval_gates_second_adjustment() {
        let clock = Arc::new(ManualClock::new(0));
        let learner = learner(clock.clone());
        assert_eq!(feed(&learner, "rpi4", 100, 17, 50.0, 50.0).len(), 1);

        clock.advance(DAY - 1);
        assert!(feed(&learner, "rpi4", 10, 17, 50.0, 50.0).is_empty());

        clock.advance(1);
        let adj = feed(&learner, "rpi4", 1, 17, 50.0, 50.0);
        assert_eq!(adj.len(), 1);
        assert!((adj[0].new_factor - 1.7).abs() < 1e-9);
        assert_eq!(learner.get_profile("rpi4").unwrap().adjustments_count, 2);
    }

    #[test]
    fn no_match_does_not_reset_gate() {
        let clock = Arc::new(ManualClock::new(500));
        let learner = learner(clock.clone());
        // 0.6 ratio, moderate load: no rule fires.
        assert!(feed(&learner, "rpi4", 150, 12, 75.0, 75.0).is_empty());
        let profile = learner.get_profile("rpi4").unwrap();
        assert_eq!(profile.adjustments_count, 0);
        assert_eq!(profile.last_adjustment, None);
    }

    #[test]
    fn low_utilization_and_saturation_lower_factor() {
        let clock = Arc::new(ManualClock::new(0));
        let learner = learner(clock.clone());

        let adj = feed(&learner, "idle", 100, 4, 20.0, 20.0);
        assert_eq!(adj[0].reason, AdjustmentReason::LowUtilization);
        assert!((adj[0].new_factor - 1.4).abs() < 1e-9);

        let adj = feed(&learner, "hot", 100, 14, 90.0, 60.0);
        assert_eq!(adj[0].reason, AdjustmentReason::ResourcesSaturated);
        assert!((adj[0].new_factor - 1.3).abs() < 1e-9);
    }

    #[test]
    fn high_latency_lowers_factor() {
        let learner = learner(Arc::new(ManualClock::new(0)));
        let adjustments: Vec<_> = (0..100)
            .filter_map(|_| learner.record_sample("edge", 20, 14, 60.0, 60.0, 1500.0))
            .collect();
        assert_eq!(adjustments.len(), 1);
        assert_eq!(adjustments[0].reason, AdjustmentReason::HighLatency);
    }

    #[test]
    fn factor_at_bound_is_not_an_adjustment() {
        let clock = Arc::new(ManualClock::new(0));
        let learner = learner(clock.clone());
        for _ in 0..3 {
            feed(&learner, "idle", 100, 2, 10.0, 10.0);
            clock.advance(DAY);
        }
        let profile = learner.get_profile("idle").unwrap();
        assert!((profile.overbooking_factor - 1.2).abs() < 1e-9);
        let count = profile.adjustments_count;

        assert!(feed(&learner, "idle", 1, 2, 10.0, 10.0).is_empty());
        assert_eq!(learner.get_profile("idle").unwrap().adjustments_count, count);
    }

    #[test]
    fn adjustment_propagates_to_siblings() {
        let learner = learner(Arc::new(ManualClock::new(0)));
        learner.get_factor("rpi4_a");
        learner.get_factor("rpi4_b");
        learner.get_factor("jetson_nano");

        let adj = feed(&learner, "rpi4_a", 100, 17, 50.0, 50.0);
        assert_eq!(adj.len(), 1);
        assert_eq!(adj[0].propagated_to, vec!["rpi4_b".to_string()]);

        assert!((learner.get_factor("rpi4_a") - 1.6).abs() < 1e-9);
        assert!((learner.get_factor("rpi4_b") - 1.55).abs() < 1e-9);
        assert_eq!(learner.get_factor("jetson_nano"), 1.5);
        // Propagation is not an adjustment of the sibling.
        assert_eq!(learner.get_profile("rpi4_b").unwrap().adjustments_count, 0);
    }

    #[test]
    fn samples_are_capped_oldest_first() {
        let config = LearnerConfig {
            max_samples: 10,
            min_samples_for_adjustment: 1000,
            ..LearnerConfig::default()
        };
        let clock = Arc::new(ManualClock::new(0));
        let learner = CapacityLearner::open(
            Arc::new(MemoryBackend::<ProfileRecord>::new()),
            clock.clone(),
            config,
        );
        for _ in 0..25 {
            clock.advance(1);
            learner.record_sample("rpi4", 10, 5, 10.0, 10.0, 0.0);
        }
        let profile = learner.get_profile("rpi4").unwrap();
        assert_eq!(profile.samples.len(), 10);
        assert_eq!(profile.samples.first().map(|s| s.timestamp), Some(16));
        assert_eq!(profile.samples.last().map(|s| s.timestamp), Some(25));
    }

    #[test]
    fn analysis_uses_recent_window_only() {
        let config = LearnerConfig {
            analysis_window: 50,
            min_samples_for_adjustment: 150,
            ..LearnerConfig::default()
        };
        let learner = CapacityLearner::open(
            Arc::new(MemoryBackend::<ProfileRecord>::new()),
            Arc::new(ManualClock::new(0)),
            config,
        );
        // Old history is idle; the last 50 samples are busy with headroom.
        feed(&learner, "rpi4", 100, 2, 10.0, 10.0);
        let adj = feed(&learner, "rpi4", 50, 18, 40.0, 40.0);
        assert_eq!(adj.len(), 1);
        assert_eq!(adj[0].reason, AdjustmentReason::HighUtilization);
    }

    #[test]
    fn effective_capacity_floors() {
        let learner = learner(Arc::new(ManualClock::new(0)));
        assert_eq!(learner.effective_capacity("rpi4", 5), 7);
        assert_eq!(learner.effective_capacity("rpi4", 0), 0);
        assert_eq!(learner.effective_capacity("rpi4", 10), 15);
    }

    #[test]
    fn stats_use_last_hundred_samples() {
        let clock = Arc::new(ManualClock::new(0));
        let config = LearnerConfig {
            min_samples_for_adjustment: 10_000,
            ..LearnerConfig::default()
        };
        let learner = CapacityLearner::open(
            Arc::new(MemoryBackend::<ProfileRecord>::new()),
            clock,
            config,
        );
        feed(&learner, "rpi4", 50, 0, 90.0, 10.0);
        feed(&learner, "rpi4", 100, 10, 30.0, 10.0);

        let stats = learner.get_stats();
        let rpi = &stats["rpi4"];
        assert_eq!(rpi.samples_count, 150);
        assert!((rpi.avg_active_ratio - 0.5).abs() < 1e-9);
        assert!((rpi.avg_cpu_percent - 30.0).abs() < 1e-9);
        assert_eq!(rpi.overbooking_factor, 1.5);
        assert_eq!(rpi.last_adjustment, None);
    }

    #[test]
    fn zero_registered_counts_as_idle() {
        let learner = learner(Arc::new(ManualClock::new(0)));
        let adj: Vec<_> = (0..100)
            .filter_map(|_| learner.record_sample("empty", 0, 0, 5.0, 5.0, 0.0))
            .collect();
        assert_eq!(adj[0].reason, AdjustmentReason::LowUtilization);
    }

    #[test]
    fn factor_stays_in_bounds_under_random_load() {
        // Small LCG so the sequence is reproducible without extra crates.
        let mut state: u64 = 0x2545_F491_4F6C_DD1D;
        let mut next = move |bound: u64| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            (state >> 33) % bound
        };

        let clock = Arc::new(ManualClock::new(0));
        let config = LearnerConfig {
            min_samples_for_adjustment: 5,
            adjustment_interval: Duration::from_secs(0),
            ..LearnerConfig::default()
        };
        let learner = CapacityLearner::open(
            Arc::new(MemoryBackend::<ProfileRecord>::new()),
            clock.clone(),
            config,
        );
        let devices = ["rpi4_a", "rpi4_b", "rpi4-c", "x86"];

        for _ in 0..3000 {
            clock.advance(next(5));
            let device = devices[next(devices.len() as u64) as usize];
            let registered = next(30) as u32;
            let active = if registered == 0 { 0 } else { next(u64::from(registered) + 1) as u32 };
            learner.record_sample(
                device,
                registered,
                active,
                next(101) as f64,
                next(101) as f64,
                next(3000) as f64,
            );
            for (device, stats) in learner.get_stats() {
                assert!(
                    (1.2..=2.0).contains(&stats.overbooking_factor),
                    "{device} out of bounds: {}",
                    stats.overbooking_factor
                );
            }
        }
    }

    #[test]
    fn profiles_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capacity.json");
        let clock = Arc::new(ManualClock::new(0));

        {
            let learner = CapacityLearner::open(
                Arc::new(JsonFileBackend::<ProfileRecord>::new(&path)),
                clock.clone(),
                LearnerConfig::default(),
            );
            feed(&learner, "rpi4", 100, 17, 50.0, 50.0);
        }

        let learner = CapacityLearner::open(
            Arc::new(JsonFileBackend::<ProfileRecord>::new(&path)),
            clock,
            LearnerConfig::default(),
        );
        let profile = learner.get_profile("rpi4").unwrap();
        assert!((profile.overbooking_factor - 1.6).abs() < 1e-9);
        assert_eq!(profile.adjustments_count, 1);
        assert_eq!(profile.samples.len(), 100);
    }

    #[test]
    fn out_of_range_persisted_factor_is_clamped() {
        let mut rows = BTreeMap::new();
        rows.insert("rpi4".to_string(), ProfileRecord::with_factor(3.0));
        let learner = CapacityLearner::open(
            Arc::new(MemoryBackend::with_rows(rows)),
            Arc::new(ManualClock::new(0)),
            LearnerConfig::default(),
        );
        assert_eq!(learner.get_factor("rpi4"), 2.0);
    }
}
