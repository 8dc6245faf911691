//! `agentgrid.toml` configuration.
//!
//! ```toml
//! [server]
//! port = 8080
//!
//! [storage]
//! backend = "redb"          # or "json"
//! data_dir = "/var/lib/agentgrid"
//!
//! [liveness]
//! heartbeat_interval = "30s"
//! suspect_after = "60s"
//! dead_after = "90s"
//! check_interval = "10s"
//!
//! [capacity]
//! min_samples = 100
//! adjustment_interval = "24h"
//! ```
//!
//! Every key is optional. A missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use agentgrid_capacity::LearnerConfig;
use agentgrid_cluster::LivenessConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub liveness: LivenessSection,
    pub capacity: CapacitySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// One JSON file per table.
    Json,
    /// A single embedded redb database.
    #[default]
    Redb,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageKind,
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::default(),
            data_dir: PathBuf::from("/var/lib/agentgrid"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LivenessSection {
    pub heartbeat_interval: String,
    pub suspect_after: String,
    pub dead_after: String,
    pub check_interval: String,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            heartbeat_interval: "30s".to_string(),
            suspect_after: "60s".to_string(),
            dead_after: "90s".to_string(),
            check_interval: "10s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapacitySection {
    pub min_samples: usize,
    pub adjustment_interval: String,
    pub max_samples: usize,
    pub default_factor: f64,
    pub min_factor: f64,
    pub max_factor: f64,
}

impl Default for CapacitySection {
    fn default() -> Self {
        let defaults = LearnerConfig::default();
        Self {
            min_samples: defaults.min_samples_for_adjustment,
            adjustment_interval: "24h".to_string(),
            max_samples: defaults.max_samples,
            default_factor: defaults.default_factor,
            min_factor: defaults.min_factor,
            max_factor: defaults.max_factor,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, or defaults when no path is given or the file
    /// does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::info!(?path, "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        // Surface bad durations at startup rather than on first use.
        config.liveness_config()?;
        config.learner_config()?;
        Ok(config)
    }

    pub fn liveness_config(&self) -> anyhow::Result<LivenessConfig> {
        let s = &self.liveness;
        let config = LivenessConfig {
            heartbeat_interval: parse_duration(&s.heartbeat_interval)?,
            suspect_after: parse_duration(&s.suspect_after)?,
            dead_after: parse_duration(&s.dead_after)?,
            check_interval: parse_duration(&s.check_interval)?,
        };
        if config.suspect_after >= config.dead_after {
            bail!("liveness.suspect_after must be shorter than liveness.dead_after");
        }
        if config.check_interval.is_zero() {
            bail!("liveness.check_interval must be positive");
        }
        Ok(config)
    }

    pub fn learner_config(&self) -> anyhow::Result<LearnerConfig> {
        let c = &self.capacity;
        if !(c.min_factor <= c.default_factor && c.default_factor <= c.max_factor) {
            bail!("capacity factors must satisfy min_factor <= default_factor <= max_factor");
        }
        if c.max_samples == 0 {
            bail!("capacity.max_samples must be positive");
        }
        Ok(LearnerConfig {
            min_samples_for_adjustment: c.min_samples,
            adjustment_interval: parse_duration(&c.adjustment_interval)?,
            max_samples: c.max_samples,
            default_factor: c.default_factor,
            min_factor: c.min_factor,
            max_factor: c.max_factor,
            ..LearnerConfig::default()
        })
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "24h".
/// A bare number is seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, unit_secs, millis) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0, true)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1, false)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60, false)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600, false)
    } else {
        (s, 1, false)
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    if millis {
        return Ok(Duration::from_millis(value));
    }
    let secs = value
        .checked_mul(unit_secs)
        .with_context(|| format!("duration {s:?} is too large"))?;
    Ok(Duration::from_secs(secs))
}
