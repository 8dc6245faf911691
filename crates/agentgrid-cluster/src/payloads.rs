//! Wire payloads exchanged between node hosts and the control plane.
//!
//! All bodies are JSON. Responses from the control plane are wrapped in
//! an [`ApiResponse`] envelope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use agentgrid_state::NodeResources;

/// Response envelope used by every REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Liveness state of a node host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Registered,
    Online,
    Suspect,
    Dead,
}

impl NodeState {
    /// Whether the node may receive new or relocated agents.
    pub fn is_candidate(self) -> bool {
        matches!(self, Self::Registered | Self::Online)
    }
}

// ── Registration ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    pub device_type: String,
    pub resources: NodeResources,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
}

/// Agents that were moved off a node while it was dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOffer {
    pub node_id: String,
    pub agent_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_id: String,
    pub state: NodeState,
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub recovered: Option<RecoveryOffer>,
}

// ── Heartbeat ────────────────────────────────────────────────────

/// Per-agent status reported by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub status: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default)]
    pub actions_executed: u64,
    #[serde(default)]
    pub errors: u64,
}

impl AgentStatus {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub disk_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub agents_count: u32,
    #[serde(default)]
    pub agents_status: HashMap<String, AgentStatus>,
    #[serde(default)]
    pub resources_usage: ResourceUsage,
    /// Mean action latency observed on the node; 0 when unmeasured.
    #[serde(default)]
    pub latency_ms: f64,
}

fn default_status() -> String {
    "online".to_string()
}

impl HeartbeatRequest {
    /// (registered, active) agent counts as seen by the node.
    pub fn agent_counts(&self) -> (u32, u32) {
        let registered = self.agents_status.len() as u32;
        let active = self.agents_status.values().filter(|a| a.is_active()).count() as u32;
        (registered, active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    /// The control plane does not know this node as live; register again.
    #[serde(default)]
    pub reregister: bool,
    #[serde(default)]
    pub pending_commands: usize,
}

// ── Commands ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    DeployAgent,
    DestroyAgent,
    UpdateAgent,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::DeployAgent => "deploy_agent",
            Self::DestroyAgent => "destroy_agent",
            Self::UpdateAgent => "update_agent",
        })
    }
}

/// A command delivered to a node host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Body of `POST /nodes/{id}/commands`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Body of `POST /nodes/{id}/commands/{cmd}/ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
