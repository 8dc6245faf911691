//! Agent factory — the agent subsystem's hook into placement.
//!
//! When an agent lands on a node (new placement or failover), the
//! orchestrator sends that node a `deploy_agent` command. What goes into the
//! command body is owned by whoever creates agents, not by the registry.

use agentgrid_state::AgentPlacement;

/// Builds the `deploy_agent` payload for a placed agent.
pub trait AgentFactory: Send + Sync {
    fn deploy_payload(&self, placement: &AgentPlacement) -> serde_json::Value;
}

/// Sends the stored config blob as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigPassthrough;

impl AgentFactory for ConfigPassthrough {
    fn deploy_payload(&self, placement: &AgentPlacement) -> serde_json::Value {
        serde_json::json!({
            "agent_id": placement.agent_id,
            "config": placement.config,
        })
    }
}
