//! Node mode — runs on a node host and serves the control plane.
//!
//! In this mode, the daemon:
//! 1. Reads host resources (core count, `/proc/meminfo`)
//! 2. Registers with the control plane and heartbeats on its cadence
//! 3. Applies deploy/destroy/update commands to a local agent table
//! 4. On shutdown, deregisters so the control plane relocates its agents
//!
//! This host keeps a table of agent configs and runs no agent runtime.
//! The status it reports reflects that table: an agent whose config sets
//! `"paused": true` is paused, every other one is active.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use agentgrid_cluster::{
    AgentConfig, AgentStatus, Command, CommandHandler, CommandKind, NodeAgent, ResourceUsage,
};
use agentgrid_state::NodeResources;

/// Settings for one node host.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub control_plane_url: String,
    pub node_id: String,
    pub device_type: String,
    pub max_agents: u32,
    pub cpu_cores: Option<u32>,
    pub memory_gb: Option<f64>,
    pub disk_gb: f64,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct AgentPayload {
    agent_id: String,
    #[serde(default)]
    config: serde_json::Value,
}

#[derive(Debug)]
struct LocalAgent {
    config: serde_json::Value,
    updates: u64,
}

impl LocalAgent {
    fn status(&self) -> &'static str {
        match self.config.get("paused").and_then(serde_json::Value::as_bool) {
            Some(true) => "paused",
            _ => "active",
        }
    }
}

/// The agents hosted on this node, driven by control-plane commands.
#[derive(Default)]
pub struct LocalAgents {
    agents: Mutex<BTreeMap<String, LocalAgent>>,
}

impl LocalAgents {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, LocalAgent>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn config_of(&self, agent_id: &str) -> Option<serde_json::Value> {
        self.lock().get(agent_id).map(|a| a.config.clone())
    }
}

impl CommandHandler for LocalAgents {
    fn handle(&self, command: &Command) -> anyhow::Result<()> {
        let payload: AgentPayload = serde_json::from_value(command.data.clone())
            .with_context(|| format!("malformed {} payload", command.kind))?;
        let mut agents = self.lock();

        match command.kind {
            CommandKind::DeployAgent => {
                info!(agent_id = %payload.agent_id, "agent deployed");
                agents.insert(
                    payload.agent_id,
                    LocalAgent {
                        config: payload.config,
                        updates: 0,
                    },
                );
            }
            CommandKind::UpdateAgent => {
                let Some(agent) = agents.get_mut(&payload.agent_id) else {
                    bail!("agent {} is not running here", payload.agent_id);
                };
                agent.config = payload.config;
                agent.updates += 1;
                info!(agent_id = %payload.agent_id, "agent config updated");
            }
            CommandKind::DestroyAgent => {
                if agents.remove(&payload.agent_id).is_some() {
                    info!(agent_id = %payload.agent_id, "agent destroyed");
                } else {
                    warn!(agent_id = %payload.agent_id, "destroy for unknown agent ignored");
                }
            }
        }
        Ok(())
    }

    fn agents_status(&self) -> HashMap<String, AgentStatus> {
        self.lock()
            .iter()
            .map(|(id, agent)| {
                (
                    id.clone(),
                    AgentStatus {
                        status: agent.status().to_string(),
                        actions_executed: agent.updates,
                        ..AgentStatus::default()
                    },
                )
            })
            .collect()
    }

    fn resources_usage(&self) -> ResourceUsage {
        host_usage()
    }
}

// ── Host readings ─────────────────────────────────────────────────

/// `(total_kib, available_kib)` from `/proc/meminfo` content.
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    Some((field("MemTotal")?, field("MemAvailable")?))
}

/// One-minute load average as a percentage of `cores`, capped at 100.
fn parse_loadavg(content: &str, cores: u32) -> Option<f64> {
    let load: f64 = content.split_whitespace().next()?.parse().ok()?;
    Some((load / f64::from(cores.max(1)) * 100.0).min(100.0))
}

fn core_count() -> u32 {
    std::thread::available_parallelism().map_or(1, |n| n.get() as u32)
}

fn host_usage() -> ResourceUsage {
    let cpu_percent = std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| parse_loadavg(&s, core_count()))
        .unwrap_or(0.0);
    let memory_percent = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| parse_meminfo(&s))
        .filter(|(total, _)| *total > 0)
        .map_or(0.0, |(total, avail)| {
            (total.saturating_sub(avail)) as f64 / total as f64 * 100.0
        });
    ResourceUsage {
        cpu_percent,
        memory_percent,
        disk_percent: 0.0,
    }
}

fn host_memory_gb() -> f64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| parse_meminfo(&s))
        .map_or(0.0, |(total, _)| total as f64 / (1024.0 * 1024.0))
}

fn resources(settings: &NodeSettings) -> NodeResources {
    NodeResources {
        cpu_cores: settings.cpu_cores.unwrap_or_else(core_count),
        memory_gb: settings.memory_gb.unwrap_or_else(host_memory_gb),
        disk_gb: settings.disk_gb,
        max_agents: settings.max_agents,
    }
}

/// Run the node host until Ctrl-C.
pub async fn run_node(settings: NodeSettings) -> anyhow::Result<()> {
    info!(node_id = %settings.node_id, "AgentGrid daemon starting in node mode");

    let resources = resources(&settings);
    info!(?resources, "host resources detected");

    let agent = NodeAgent::new(AgentConfig {
        control_plane_url: settings.control_plane_url,
        node_id: settings.node_id,
        device_type: settings.device_type,
        resources,
        capabilities: HashMap::new(),
        request_timeout: settings.request_timeout,
    })?;
    let handler = LocalAgents::default();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    agent.run(&handler, shutdown_rx).await?;

    if let Err(e) = agent.deregister().await {
        warn!(error = %e, "deregistration failed; control plane will time this node out");
    }
    info!(agents = handler.ids().len(), "node stopped");
    Ok(())
}
