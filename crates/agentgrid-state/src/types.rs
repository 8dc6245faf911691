//! Domain types for the AgentGrid state tables.
//!
//! Table rows (`PlacementRecord`, `ProfileRecord`) are what gets persisted:
//! the row key (agent id, device type) lives in the table map and is not
//! repeated inside the value. The keyed views (`AgentPlacement`,
//! `DeviceProfile`) are what the registry and learner hand to callers.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Unique identifier for an agent.
pub type AgentId = String;

/// Unique identifier for a node host.
pub type NodeId = String;

/// Device class key (hardware family), e.g. `rpi4_a`.
pub type DeviceType = String;

// ── Placement ─────────────────────────────────────────────────────

/// Persisted placement row, keyed by agent id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacementRecord {
    /// Node currently hosting the agent.
    pub node_id: NodeId,
    /// Opaque agent configuration, stored verbatim.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Unix timestamp (seconds) of the last placement change.
    pub placed_at: u64,
    /// Whether this placement was created by failover.
    #[serde(default)]
    pub is_temporary: bool,
    /// Pre-failure home; set only while `is_temporary` is true.
    #[serde(default)]
    pub original_node_id: Option<NodeId>,
}

/// A placed agent, as returned by the placement registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPlacement {
    pub agent_id: AgentId,
    pub node_id: NodeId,
    pub config: serde_json::Value,
    pub placed_at: u64,
    pub is_temporary: bool,
    pub original_node_id: Option<NodeId>,
}

impl AgentPlacement {
    /// Build the keyed view of a persisted row.
    pub fn from_record(agent_id: &str, record: &PlacementRecord) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            node_id: record.node_id.clone(),
            config: record.config.clone(),
            placed_at: record.placed_at,
            is_temporary: record.is_temporary,
            original_node_id: record.original_node_id.clone(),
        }
    }
}

impl PlacementRecord {
    /// Whether the temporary/original invariant holds for this row.
    pub fn is_consistent(&self) -> bool {
        match (&self.original_node_id, self.is_temporary) {
            (Some(original), true) => original != &self.node_id,
            (None, false) => true,
            _ => false,
        }
    }
}

// ── Capacity ──────────────────────────────────────────────────────

/// One load observation reported by a node of some device class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LoadSample {
    /// Unix timestamp (seconds) the sample was recorded.
    pub timestamp: u64,
    pub agents_registered: u32,
    pub agents_active: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Observed latency in milliseconds; 0 means unmeasured.
    #[serde(default)]
    pub latency_ms: f64,
}

impl LoadSample {
    /// Fraction of registered agents that were active.
    ///
    /// A sample with no registered agents counts as fully idle.
    pub fn active_ratio(&self) -> f64 {
        if self.agents_registered == 0 {
            0.0
        } else {
            f64::from(self.agents_active) / f64::from(self.agents_registered)
        }
    }
}

/// Persisted capacity profile row, keyed by device type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileRecord {
    pub overbooking_factor: f64,
    #[serde(default)]
    pub adjustments_count: u32,
    #[serde(default)]
    pub last_adjustment: Option<u64>,
    /// Oldest first; capped by the learner.
    #[serde(default)]
    pub samples: VecDeque<LoadSample>,
}

impl ProfileRecord {
    /// A fresh profile with the given starting factor and no history.
    pub fn with_factor(factor: f64) -> Self {
        Self {
            overbooking_factor: factor,
            adjustments_count: 0,
            last_adjustment: None,
            samples: VecDeque::new(),
        }
    }
}

/// A device class profile, as returned by the capacity learner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceProfile {
    pub device_type: DeviceType,
    pub overbooking_factor: f64,
    pub adjustments_count: u32,
    pub last_adjustment: Option<u64>,
    pub samples: Vec<LoadSample>,
}

impl DeviceProfile {
    /// Build the keyed view of a persisted row.
    pub fn from_record(device_type: &str, record: &ProfileRecord) -> Self {
        Self {
            device_type: device_type.to_string(),
            overbooking_factor: record.overbooking_factor,
            adjustments_count: record.adjustments_count,
            last_adjustment: record.last_adjustment,
            samples: record.samples.iter().copied().collect(),
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Raw capacity declared by a node at registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeResources {
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_gb: f64,
    #[serde(default)]
    pub disk_gb: f64,
    /// Agent slots before overbooking is applied.
    pub max_agents: u32,
}
