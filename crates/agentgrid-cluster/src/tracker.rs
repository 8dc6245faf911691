//! Node heartbeat tracker — liveness, failover and recovery.
//!
//! Tracks every node host in memory. Node state is not persisted: after a
//! control-plane restart nodes are unknown until they register again, and a
//! node that re-registers is offered back whatever was relocated away from
//! it. Placement and capacity state live in their own durable tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use agentgrid_capacity::{Adjustment, CapacityLearner};
use agentgrid_placement::{
    AgentFactory, ConfigPassthrough, NodeCapacity, PlacementError, PlacementRegistry,
    PlacementRequirements,
};
use agentgrid_state::{AgentPlacement, Clock, NodeResources};

use crate::commands::CommandQueue;
use crate::error::{ClusterError, ClusterResult};
use crate::payloads::{CommandKind, HeartbeatRequest, NodeState, RecoveryOffer, ResourceUsage};

/// Liveness thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Cadence nodes are told to heartbeat at.
    pub heartbeat_interval: Duration,
    /// Silence after which a node is suspect.
    pub suspect_after: Duration,
    /// Silence after which a node is dead and its agents are relocated.
    pub dead_after: Duration,
    /// How often the liveness loop polls.
    pub check_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            suspect_after: Duration::from_secs(60),
            dead_after: Duration::from_secs(90),
            check_interval: Duration::from_secs(10),
        }
    }
}

struct NodeEntry {
    device_type: String,
    resources: NodeResources,
    capabilities: HashMap<String, serde_json::Value>,
    state: NodeState,
    registered_at: u64,
    last_seen: u64,
    last_usage: Option<ResourceUsage>,
}

/// A node as reported by [`NodeHeartbeatTracker::list_nodes`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_id: String,
    pub device_type: String,
    pub state: NodeState,
    pub resources: NodeResources,
    pub capabilities: HashMap<String, serde_json::Value>,
    pub registered_at: u64,
    pub last_seen: u64,
    pub last_usage: Option<ResourceUsage>,
    /// Declared `max_agents` scaled by the device class's overbooking factor.
    pub effective_capacity: u32,
    pub agents: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub node_id: String,
    pub from: NodeState,
    pub to: NodeState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub agent_id: String,
    pub from: String,
    pub to: String,
}

/// What happened to the agents of a node that died or left.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeathReport {
    pub node_id: String,
    pub relocated: Vec<Relocation>,
    /// Orphans no live node had room for; they stay on the dead node.
    pub unplaced: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterOutcome {
    pub state: NodeState,
    pub recovered: Option<RecoveryOffer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatOutcome {
    pub acknowledged: bool,
    pub reregister: bool,
    pub adjustment: Option<Adjustment>,
}

/// Tracks node hosts and drives failover.
pub struct NodeHeartbeatTracker {
    nodes: Mutex<BTreeMap<String, NodeEntry>>,
    /// Serializes evacuations with registrations. Taken before `nodes`.
    evacuation: Mutex<()>,
    registry: Arc<PlacementRegistry>,
    learner: Arc<CapacityLearner>,
    commands: Arc<CommandQueue>,
    factory: Arc<dyn AgentFactory>,
    clock: Arc<dyn Clock>,
    config: LivenessConfig,
}

impl NodeHeartbeatTracker {
    pub fn new(
        registry: Arc<PlacementRegistry>,
        learner: Arc<CapacityLearner>,
        commands: Arc<CommandQueue>,
        clock: Arc<dyn Clock>,
        config: LivenessConfig,
    ) -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            evacuation: Mutex::new(()),
            registry,
            learner,
            commands,
            factory: Arc::new(ConfigPassthrough),
            clock,
            config,
        }
    }

    /// Use `factory` to build `deploy_agent` payloads.
    pub fn with_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn registry(&self) -> &Arc<PlacementRegistry> {
        &self.registry
    }

    pub fn learner(&self) -> &Arc<CapacityLearner> {
        &self.learner
    }

    pub fn commands(&self) -> &Arc<CommandQueue> {
        &self.commands
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, NodeEntry>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node_state(&self, node_id: &str) -> Option<NodeState> {
        self.lock().get(node_id).map(|n| n.state)
    }

    fn is_live(&self, node_id: &str) -> bool {
        self.node_state(node_id).is_some_and(NodeState::is_candidate)
    }

    // ── Registration and heartbeats ───────────────────────────────

    /// Register (or re-register) a node host.
    ///
    /// A node the tracker did not know as live is offered back the agents
    /// that were temporarily moved away from it.
    pub fn register(
        &self,
        node_id: &str,
        device_type: &str,
        resources: NodeResources,
        capabilities: HashMap<String, serde_json::Value>,
    ) -> RegisterOutcome {
        // Wait out any evacuation of this node so the offer below sees
        // every agent it relocated.
        let _evacuation = self.evacuation.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now_secs();
        let previous = self
            .lock()
            .insert(
                node_id.to_string(),
                NodeEntry {
                    device_type: device_type.to_string(),
                    resources,
                    capabilities,
                    state: NodeState::Registered,
                    registered_at: now,
                    last_seen: now,
                    last_usage: None,
                },
            )
            .map(|entry| entry.state);

        // Seed the device profile so the class shows up in capacity stats.
        let factor = self.learner.get_factor(device_type);

        let recovered = match previous {
            Some(state) if state != NodeState::Dead => None,
            _ => {
                let agent_ids = self.registry.list_temporary_from(node_id);
                (!agent_ids.is_empty()).then(|| RecoveryOffer {
                    node_id: node_id.to_string(),
                    agent_ids,
                })
            }
        };

        match (&previous, &recovered) {
            (Some(NodeState::Dead), _) | (None, Some(_)) => info!(
                %node_id,
                %device_type,
                offered = recovered.as_ref().map_or(0, |r| r.agent_ids.len()),
                "node recovered"
            ),
            (None, None) => info!(
                %node_id,
                %device_type,
                max_agents = resources.max_agents,
                factor,
                "node registered"
            ),
            (Some(state), _) => debug!(%node_id, previous = ?state, "node re-registered"),
        }

        RegisterOutcome {
            state: NodeState::Registered,
            recovered,
        }
    }

    /// Record a heartbeat and feed its load sample to the learner.
    ///
    /// Heartbeats from dead or unknown nodes are refused; the node must
    /// register again.
    pub fn heartbeat(&self, node_id: &str, report: &HeartbeatRequest) -> HeartbeatOutcome {
        let now = self.clock.now_secs();
        let device_type = {
            let mut nodes = self.lock();
            match nodes.get_mut(node_id) {
                Some(entry) if entry.state != NodeState::Dead => {
                    if entry.state == NodeState::Suspect {
                        info!(%node_id, "suspect node is back online");
                    }
                    entry.state = NodeState::Online;
                    entry.last_seen = now;
                    entry.last_usage = Some(report.resources_usage);
                    Some(entry.device_type.clone())
                }
                Some(_) => {
                    warn!(%node_id, "heartbeat from dead node, asking it to re-register");
                    None
                }
                None => {
                    warn!(%node_id, "heartbeat from unknown node, asking it to register");
                    None
                }
            }
        };

        let Some(device_type) = device_type else {
            return HeartbeatOutcome {
                acknowledged: false,
                reregister: true,
                adjustment: None,
            };
        };

        let (registered, active) = report.agent_counts();
        debug!(%node_id, registered, active, "heartbeat received");
        let adjustment = self.learner.record_sample(
            &device_type,
            registered,
            active,
            report.resources_usage.cpu_percent,
            report.resources_usage.memory_percent,
            report.latency_ms,
        );

        HeartbeatOutcome {
            acknowledged: true,
            reregister: false,
            adjustment,
        }
    }

    // ── Liveness ──────────────────────────────────────────────────

    /// Promote silent nodes to suspect or dead; relocate the agents of
    /// nodes that died. Returns the state changes made.
    pub fn check_liveness(&self) -> Vec<Transition> {
        let now = self.clock.now_secs();
        let suspect_after = self.config.suspect_after.as_secs();
        let dead_after = self.config.dead_after.as_secs();

        let transitions: Vec<Transition> = {
            let mut nodes = self.lock();
            nodes
                .iter_mut()
                .filter_map(|(node_id, entry)| {
                    let silent = now.saturating_sub(entry.last_seen);
                    let next = if silent > dead_after {
                        NodeState::Dead
                    } else if silent > suspect_after {
                        NodeState::Suspect
                    } else {
                        return None;
                    };
                    if entry.state == next || entry.state == NodeState::Dead {
                        return None;
                    }
                    let from = std::mem::replace(&mut entry.state, next);
                    Some(Transition {
                        node_id: node_id.clone(),
                        from,
                        to: next,
                    })
                })
                .collect()
        };

        for transition in &transitions {
            match transition.to {
                NodeState::Suspect => warn!(node_id = %transition.node_id, "node is suspect"),
                _ => warn!(
                    node_id = %transition.node_id,
                    from = ?transition.from,
                    "node declared dead"
                ),
            }
        }
        for transition in transitions.iter().filter(|t| t.to == NodeState::Dead) {
            self.evacuate(&transition.node_id);
        }
        transitions
    }

    /// Declare `node_id` dead now and relocate its agents.
    pub fn mark_dead(&self, node_id: &str) -> ClusterResult<DeathReport> {
        {
            let mut nodes = self.lock();
            let entry = nodes
                .get_mut(node_id)
                .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))?;
            if entry.state != NodeState::Dead {
                warn!(%node_id, from = ?entry.state, "node marked dead");
                entry.state = NodeState::Dead;
            }
        }
        Ok(self.evacuate(node_id))
    }

    /// Remove a node that is leaving; its agents are relocated.
    pub fn deregister(&self, node_id: &str) -> ClusterResult<DeathReport> {
        self.lock()
            .remove(node_id)
            .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))?;
        info!(%node_id, "node deregistered");
        Ok(self.evacuate(node_id))
    }

    /// Move every agent currently on `node_id` to a live node.
    ///
    /// Slot counts are updated as agents are assigned, so one pass never
    /// overfills a node. Agents with nowhere to go stay put. A node that
    /// registered again before the pass started keeps its agents.
    fn evacuate(&self, node_id: &str) -> DeathReport {
        let _evacuation = self.evacuation.lock().unwrap_or_else(|e| e.into_inner());
        let mut report = DeathReport {
            node_id: node_id.to_string(),
            ..DeathReport::default()
        };
        if let Some(state) = self.node_state(node_id).filter(|s| *s != NodeState::Dead) {
            info!(%node_id, ?state, "node is back, evacuation skipped");
            return report;
        }
        self.commands.discard(node_id);

        let orphans = self.registry.list_orphans(node_id);
        if orphans.is_empty() {
            return report;
        }

        let mut candidates = self.candidates();
        candidates.remove(node_id);
        let requirements = PlacementRequirements::default();

        for orphan in orphans {
            let Some(target) = self.registry.choose_node(&candidates, &requirements) else {
                report.unplaced.push(orphan.agent_id);
                continue;
            };
            match self.registry.migrate(&orphan.agent_id, &target, true) {
                Ok(placement) => {
                    if let Some(slot) = candidates.get_mut(&target) {
                        slot.current_count += 1;
                    }
                    self.commands.enqueue(
                        &target,
                        CommandKind::DeployAgent,
                        self.factory.deploy_payload(&placement),
                    );
                    report.relocated.push(Relocation {
                        agent_id: orphan.agent_id,
                        from: node_id.to_string(),
                        to: target,
                    });
                }
                // Unregistered since the orphan list was taken.
                Err(e) => debug!(agent_id = %orphan.agent_id, error = %e, "orphan vanished"),
            }
        }

        if report.unplaced.is_empty() {
            info!(%node_id, relocated = report.relocated.len(), "node evacuated");
        } else {
            warn!(
                %node_id,
                relocated = report.relocated.len(),
                unplaced = report.unplaced.len(),
                "no capacity for some orphaned agents"
            );
        }
        report
    }

    /// Live nodes with their effective capacity and current agent count.
    pub fn candidates(&self) -> HashMap<String, NodeCapacity> {
        let live: Vec<(String, String, u32)> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state.is_candidate())
            .map(|(id, entry)| (id.clone(), entry.device_type.clone(), entry.resources.max_agents))
            .collect();

        let counts = self.registry.count_by_node();
        live.into_iter()
            .map(|(node_id, device_type, raw)| {
                let max_agents = self.learner.effective_capacity(&device_type, raw);
                let current = counts.get(&node_id).copied().unwrap_or(0) as u32;
                (node_id, NodeCapacity::new(max_agents, current))
            })
            .collect()
    }

    // ── Agent placement ───────────────────────────────────────────

    /// Queue a command unless the node cannot receive it.
    fn send(&self, node_id: &str, kind: CommandKind, data: serde_json::Value) {
        if self.is_live(node_id) {
            self.commands.enqueue(node_id, kind, data);
        } else {
            debug!(%node_id, %kind, "node not live, command dropped");
        }
    }

    /// Place a new agent on the best live node and send it a deploy command.
    ///
    /// An agent that is already placed keeps its host; its config is
    /// replaced and the host gets an `update_agent` command.
    pub fn place_agent(
        &self,
        agent_id: &str,
        config: serde_json::Value,
        requirements: &PlacementRequirements,
    ) -> ClusterResult<AgentPlacement> {
        if let Some(existing) = self.registry.get(agent_id) {
            let placement = self.registry.register(
                agent_id,
                &existing.node_id,
                config,
                existing.is_temporary,
                existing.original_node_id.as_deref(),
            )?;
            self.send(
                &placement.node_id,
                CommandKind::UpdateAgent,
                self.factory.deploy_payload(&placement),
            );
            return Ok(placement);
        }

        let node_id = self
            .registry
            .choose_node(&self.candidates(), requirements)
            .ok_or(PlacementError::CapacityExhausted)?;
        let placement = self.registry.register(agent_id, &node_id, config, false, None)?;
        self.send(
            &node_id,
            CommandKind::DeployAgent,
            self.factory.deploy_payload(&placement),
        );
        Ok(placement)
    }

    /// Remove an agent's placement and tell its host to destroy it.
    pub fn remove_agent(&self, agent_id: &str) -> ClusterResult<AgentPlacement> {
        let placement = self
            .registry
            .unregister(agent_id)
            .ok_or_else(|| PlacementError::NotFound(agent_id.to_string()))?;
        self.send(
            &placement.node_id,
            CommandKind::DestroyAgent,
            serde_json::json!({ "agent_id": agent_id }),
        );
        Ok(placement)
    }

    /// Move an agent to `target`, which must be a live node.
    pub fn migrate_agent(
        &self,
        agent_id: &str,
        target: &str,
        temporary: bool,
    ) -> ClusterResult<AgentPlacement> {
        if !self.is_live(target) {
            return Err(ClusterError::UnknownNode(target.to_string()));
        }
        let from = self
            .registry
            .locate(agent_id)
            .ok_or_else(|| PlacementError::NotFound(agent_id.to_string()))?;
        let placement = self.registry.migrate(agent_id, target, temporary)?;
        if from != target {
            self.hand_over(agent_id, &from, &placement);
        }
        Ok(placement)
    }

    fn hand_over(&self, agent_id: &str, from: &str, placement: &AgentPlacement) {
        self.send(
            from,
            CommandKind::DestroyAgent,
            serde_json::json!({ "agent_id": agent_id }),
        );
        self.send(
            &placement.node_id,
            CommandKind::DeployAgent,
            self.factory.deploy_payload(placement),
        );
    }

    // ── Recovery ──────────────────────────────────────────────────

    /// Agents currently relocated away from `node_id`.
    pub fn recovery_offer(&self, node_id: &str) -> RecoveryOffer {
        RecoveryOffer {
            node_id: node_id.to_string(),
            agent_ids: self.registry.list_temporary_from(node_id),
        }
    }

    /// Keep a relocated agent where it is.
    ///
    /// The origin may still run its old copy after recovering, so it is
    /// told to destroy it.
    pub fn accept_relocation(&self, agent_id: &str) -> ClusterResult<AgentPlacement> {
        let origin = self
            .registry
            .get(agent_id)
            .and_then(|current| current.original_node_id);
        let placement = self.registry.mark_permanent(agent_id)?;
        if let Some(origin) = origin.filter(|o| *o != placement.node_id) {
            self.send(
                &origin,
                CommandKind::DestroyAgent,
                serde_json::json!({ "agent_id": agent_id }),
            );
        }
        info!(%agent_id, node_id = %placement.node_id, "relocation accepted");
        Ok(placement)
    }

    /// Move a relocated agent back to its original node, permanently.
    pub fn return_home(&self, agent_id: &str) -> ClusterResult<AgentPlacement> {
        let current = self
            .registry
            .get(agent_id)
            .ok_or_else(|| PlacementError::NotFound(agent_id.to_string()))?;
        let origin = match (current.is_temporary, current.original_node_id) {
            (true, Some(origin)) => origin,
            _ => {
                return Err(PlacementError::InvalidTemporary {
                    agent_id: agent_id.to_string(),
                    reason: "placement is not temporary".to_string(),
                }
                .into());
            }
        };
        if !self.is_live(&origin) {
            return Err(ClusterError::UnknownNode(origin));
        }

        let placement = self.registry.migrate(agent_id, &origin, false)?;
        self.hand_over(agent_id, &current.node_id, &placement);
        info!(%agent_id, from = %current.node_id, to = %origin, "agent returned home");
        Ok(placement)
    }

    // ── Inspection ────────────────────────────────────────────────

    pub fn list_nodes(&self) -> Vec<NodeView> {
        let counts = self.registry.count_by_node();
        let views: Vec<NodeView> = self
            .lock()
            .iter()
            .map(|(node_id, entry)| NodeView {
                node_id: node_id.clone(),
                device_type: entry.device_type.clone(),
                state: entry.state,
                resources: entry.resources,
                capabilities: entry.capabilities.clone(),
                registered_at: entry.registered_at,
                last_seen: entry.last_seen,
                last_usage: entry.last_usage,
                effective_capacity: 0,
                agents: counts.get(node_id).copied().unwrap_or(0),
            })
            .collect();

        // Factor lookups take the learner lock; do them after releasing ours.
        views
            .into_iter()
            .map(|view| NodeView {
                effective_capacity: self
                    .learner
                    .effective_capacity(&view.device_type, view.resources.max_agents),
                ..view
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgrid_state::{ManualClock, MemoryBackend, PlacementRecord, ProfileRecord};
    use agentgrid_capacity::LearnerConfig;
    use serde_json::json;

    struct Fixture {
        clock: Arc<ManualClock>,
        tracker: NodeHeartbeatTracker,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Arc::new(PlacementRegistry::open(
            Arc::new(MemoryBackend::<PlacementRecord>::new()),
            clock.clone(),
        ));
        let learner = Arc::new(CapacityLearner::open(
            Arc::new(MemoryBackend::<ProfileRecord>::new()),
            clock.clone(),
            LearnerConfig::default(),
        ));
        let tracker = NodeHeartbeatTracker::new(
            registry,
            learner,
            Arc::new(CommandQueue::new()),
            clock.clone(),
            LivenessConfig::default(),
        );
        Fixture { clock, tracker }
    }

    fn resources(max_agents: u32) -> NodeResources {
        NodeResources {
            cpu_cores: 4,
            memory_gb: 8.0,
            disk_gb: 32.0,
            max_agents,
        }
    }

    fn register(tracker: &NodeHeartbeatTracker, node_id: &str, max_agents: u32) -> RegisterOutcome {
        tracker.register(node_id, "rpi4_a", resources(max_agents), HashMap::new())
    }

    fn heartbeat(node_id: &str) -> HeartbeatRequest {
        serde_json::from_value(json!({
            "node_id": node_id,
            "agents_status": {
                "A1": {"status": "active"},
                "A2": {"status": "idle"}
            },
            "resources_usage": {"cpu_percent": 30.0, "memory_percent": 40.0, "disk_percent": 10.0}
        }))
        .unwrap()
    }

    #[test]
    fn register_new_node() {
        let f = fixture();
        let outcome = register(&f.tracker, "n1", 4);
        assert_eq!(outcome.state, NodeState::Registered);
        assert!(outcome.recovered.is_none());
        assert_eq!(f.tracker.node_state("n1"), Some(NodeState::Registered));
        // Device class is known to the learner.
        assert!(f.tracker.learner().get_profile("rpi4_a").is_some());
    }

    #[test]
    fn heartbeat_goes_online_and_feeds_learner() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        let outcome = f.tracker.heartbeat("n1", &heartbeat("n1"));
        assert!(outcome.acknowledged);
        assert!(!outcome.reregister);
        assert_eq!(f.tracker.node_state("n1"), Some(NodeState::Online));

        let profile = f.tracker.learner().get_profile("rpi4_a").unwrap();
        assert_eq!(profile.samples.len(), 1);
        let sample = profile.samples[0];
        assert_eq!(sample.agents_registered, 2);
        assert_eq!(sample.agents_active, 1);
        assert_eq!(sample.cpu_percent, 30.0);
        assert_eq!(sample.memory_percent, 40.0);
    }

    #[test]
    fn heartbeat_from_unknown_node_asks_to_register() {
        let f = fixture();
        let outcome = f.tracker.heartbeat("ghost", &heartbeat("ghost"));
        assert!(!outcome.acknowledged);
        assert!(outcome.reregister);
        assert!(f.tracker.learner().get_stats().is_empty());
    }

    #[test]
    fn silence_moves_through_suspect_to_dead() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        f.tracker.heartbeat("n1", &heartbeat("n1"));

        f.clock.advance(60);
        assert!(f.tracker.check_liveness().is_empty());

        f.clock.advance(1);
        let transitions = f.tracker.check_liveness();
        assert_eq!(
            transitions,
            vec![Transition {
                node_id: "n1".to_string(),
                from: NodeState::Online,
                to: NodeState::Suspect,
            }]
        );
        // Suspect nodes take no new agents.
        assert!(f.tracker.candidates().is_empty());

        // A heartbeat brings it back.
        assert!(f.tracker.heartbeat("n1", &heartbeat("n1")).acknowledged);
        assert_eq!(f.tracker.node_state("n1"), Some(NodeState::Online));

        f.clock.advance(91);
        let transitions = f.tracker.check_liveness();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, NodeState::Dead);

        // Dead nodes are not re-reported and must re-register.
        f.clock.advance(100);
        assert!(f.tracker.check_liveness().is_empty());
        assert!(f.tracker.heartbeat("n1", &heartbeat("n1")).reregister);
    }

    #[test]
    fn mark_dead_relocates_orphans_as_temporary() {
        let f = fixture();
        // Effective capacity: floor(2 * 1.5) = 3 per node.
        register(&f.tracker, "n1", 2);
        register(&f.tracker, "n2", 2);
        register(&f.tracker, "n3", 2);

        let registry = f.tracker.registry();
        for agent in ["A1", "A2", "A3", "A4"] {
            registry.register(agent, "n1", json!({}), false, None).unwrap();
        }
        registry.register("B1", "n2", json!({}), false, None).unwrap();

        let orphans: Vec<String> = registry
            .list_orphans("n1")
            .into_iter()
            .map(|p| p.agent_id)
            .collect();
        let report = f.tracker.mark_dead("n1").unwrap();

        assert!(report.unplaced.is_empty());
        let moved: Vec<&str> = report.relocated.iter().map(|r| r.agent_id.as_str()).collect();
        assert_eq!(moved, orphans.iter().map(String::as_str).collect::<Vec<_>>());
        for agent in &orphans {
            let placement = registry.get(agent).unwrap();
            assert!(placement.is_temporary);
            assert_eq!(placement.original_node_id.as_deref(), Some("n1"));
            assert_ne!(placement.node_id, "n1");
        }
        assert!(registry.list_orphans("n1").is_empty());

        // Counts were tracked during the pass: n2 had one agent already.
        let counts = registry.count_by_node();
        assert_eq!(counts.get("n2").copied().unwrap_or(0), 3);
        assert_eq!(counts.get("n3").copied().unwrap_or(0), 2);

        // Each relocated agent got a deploy command on its new host.
        let deploys: usize = ["n2", "n3"]
            .iter()
            .flat_map(|n| f.tracker.commands().poll(n))
            .filter(|c| c.kind == CommandKind::DeployAgent)
            .count();
        assert_eq!(deploys, 4);
    }

    #[test]
    fn orphans_without_capacity_stay_put() {
        let f = fixture();
        register(&f.tracker, "n1", 10);
        register(&f.tracker, "n2", 1); // effective 1
        let registry = f.tracker.registry();
        for agent in ["A1", "A2", "A3"] {
            registry.register(agent, "n1", json!({}), false, None).unwrap();
        }

        let report = f.tracker.mark_dead("n1").unwrap();
        assert_eq!(report.relocated.len(), 1);
        assert_eq!(report.relocated[0].to, "n2");
        assert_eq!(report.unplaced.len(), 2);
        assert_eq!(registry.list_orphans("n1").len(), 2);
    }

    #[test]
    fn liveness_check_triggers_relocation() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        f.tracker
            .registry()
            .register("A1", "n1", json!({}), false, None)
            .unwrap();

        f.clock.advance(50);
        register(&f.tracker, "n2", 4);
        f.clock.advance(45);

        let transitions = f.tracker.check_liveness();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].node_id, "n1");
        assert_eq!(f.tracker.registry().locate("A1").as_deref(), Some("n2"));
    }

    #[test]
    fn dead_node_recovery_offer_and_return_home() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        register(&f.tracker, "n2", 4);
        let registry = f.tracker.registry();
        registry.register("A1", "n1", json!({"k": 1}), false, None).unwrap();
        registry.register("A2", "n1", json!({}), false, None).unwrap();
        f.tracker.mark_dead("n1").unwrap();
        f.tracker.commands().poll("n2");

        let outcome = register(&f.tracker, "n1", 4);
        let offer = outcome.recovered.unwrap();
        assert_eq!(offer.node_id, "n1");
        assert_eq!(offer.agent_ids, vec!["A1".to_string(), "A2".to_string()]);
        assert_eq!(f.tracker.recovery_offer("n1"), offer);

        let home = f.tracker.return_home("A1").unwrap();
        assert_eq!(home.node_id, "n1");
        assert!(!home.is_temporary);
        assert!(home.original_node_id.is_none());

        let kept = f.tracker.accept_relocation("A2").unwrap();
        assert_eq!(kept.node_id, "n2");
        assert!(!kept.is_temporary);
        assert!(f.tracker.recovery_offer("n1").agent_ids.is_empty());

        let to_n2 = f.tracker.commands().poll("n2");
        assert_eq!(to_n2.len(), 1);
        assert_eq!(to_n2[0].kind, CommandKind::DestroyAgent);
        let to_n1 = f.tracker.commands().poll("n1");
        assert_eq!(to_n1.len(), 2);
        assert_eq!(to_n1[0].kind, CommandKind::DeployAgent);
        assert_eq!(to_n1[0].data["config"]["k"], 1);
        // The recovered node drops its stale copy of the agent it gave up.
        assert_eq!(to_n1[1].kind, CommandKind::DestroyAgent);
        assert_eq!(to_n1[1].data["agent_id"], "A2");
    }

    #[test]
    fn accept_relocation_skips_destroy_for_unreachable_origin() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        register(&f.tracker, "n2", 4);
        f.tracker.registry().register("A1", "n1", json!({}), false, None).unwrap();
        f.tracker.mark_dead("n1").unwrap();
        f.tracker.commands().poll("n2");

        // n1 never came back: nothing can be delivered to it.
        f.tracker.accept_relocation("A1").unwrap();
        assert_eq!(f.tracker.commands().pending_count("n1"), 0);
        assert_eq!(f.tracker.commands().pending_count("n2"), 0);
    }

    #[test]
    fn evacuation_after_reregistration_leaves_agents_in_place() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        register(&f.tracker, "n2", 4);
        f.tracker.registry().register("A1", "n1", json!({}), false, None).unwrap();
        f.tracker.commands().enqueue("n1", CommandKind::UpdateAgent, json!({"agent_id": "A1"}));

        // The liveness pass declared n1 dead, then n1 registered again
        // before the pass got to relocating its agents.
        f.tracker.lock().get_mut("n1").unwrap().state = NodeState::Dead;
        register(&f.tracker, "n1", 4);
        let report = f.tracker.evacuate("n1");

        assert!(report.relocated.is_empty());
        assert!(report.unplaced.is_empty());
        let placement = f.tracker.registry().get("A1").unwrap();
        assert_eq!(placement.node_id, "n1");
        assert!(!placement.is_temporary);
        assert_eq!(f.tracker.commands().pending_count("n1"), 1);
        assert_eq!(f.tracker.commands().pending_count("n2"), 0);
    }

    #[test]
    fn return_home_requires_temporary_placement_and_live_origin() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        register(&f.tracker, "n2", 4);
        let registry = f.tracker.registry();
        registry.register("A1", "n1", json!({}), false, None).unwrap();

        assert!(matches!(
            f.tracker.return_home("A1"),
            Err(ClusterError::Placement(PlacementError::InvalidTemporary { .. }))
        ));
        assert!(matches!(
            f.tracker.return_home("nope"),
            Err(ClusterError::Placement(PlacementError::NotFound(_)))
        ));

        f.tracker.mark_dead("n1").unwrap();
        // Origin is still dead.
        assert!(matches!(
            f.tracker.return_home("A1"),
            Err(ClusterError::UnknownNode(_))
        ));
    }

    #[test]
    fn deregister_evacuates_and_forgets_node() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        register(&f.tracker, "n2", 4);
        f.tracker
            .registry()
            .register("A1", "n1", json!({}), false, None)
            .unwrap();

        let report = f.tracker.deregister("n1").unwrap();
        assert_eq!(report.relocated.len(), 1);
        assert_eq!(f.tracker.node_state("n1"), None);
        assert!(matches!(
            f.tracker.deregister("n1"),
            Err(ClusterError::UnknownNode(_))
        ));
    }

    #[test]
    fn place_agent_uses_effective_capacity() {
        let f = fixture();
        register(&f.tracker, "small", 1); // effective 1
        register(&f.tracker, "big", 4); // effective 6

        let placement = f
            .tracker
            .place_agent("A1", json!({"strategy": "x"}), &PlacementRequirements::default())
            .unwrap();
        assert_eq!(placement.node_id, "big");
        let cmds = f.tracker.commands().poll("big");
        assert_eq!(cmds[0].kind, CommandKind::DeployAgent);
        assert_eq!(cmds[0].data["agent_id"], "A1");

        // Placing again updates config in place.
        let again = f
            .tracker
            .place_agent("A1", json!({"strategy": "y"}), &PlacementRequirements::default())
            .unwrap();
        assert_eq!(again.node_id, "big");
        let cmds = f.tracker.commands().poll("big");
        assert_eq!(cmds[0].kind, CommandKind::UpdateAgent);
    }

    #[test]
    fn place_agent_reports_exhaustion() {
        let f = fixture();
        register(&f.tracker, "n1", 0);
        assert!(matches!(
            f.tracker
                .place_agent("A1", json!({}), &PlacementRequirements::default()),
            Err(ClusterError::Placement(PlacementError::CapacityExhausted))
        ));
    }

    #[test]
    fn remove_and_migrate_agent_send_commands() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        register(&f.tracker, "n2", 4);
        f.tracker
            .registry()
            .register("A1", "n1", json!({}), false, None)
            .unwrap();

        let moved = f.tracker.migrate_agent("A1", "n2", false).unwrap();
        assert_eq!(moved.node_id, "n2");
        assert_eq!(f.tracker.commands().poll("n1")[0].kind, CommandKind::DestroyAgent);
        assert_eq!(f.tracker.commands().poll("n2")[0].kind, CommandKind::DeployAgent);

        assert!(matches!(
            f.tracker.migrate_agent("A1", "ghost", false),
            Err(ClusterError::UnknownNode(_))
        ));

        let removed = f.tracker.remove_agent("A1").unwrap();
        assert_eq!(removed.node_id, "n2");
        assert_eq!(f.tracker.commands().poll("n2")[0].kind, CommandKind::DestroyAgent);
        assert!(f.tracker.remove_agent("A1").is_err());
    }

    #[test]
    fn list_nodes_reports_capacity_and_agents() {
        let f = fixture();
        register(&f.tracker, "n1", 4);
        f.tracker.heartbeat("n1", &heartbeat("n1"));
        f.tracker
            .registry()
            .register("A1", "n1", json!({}), false, None)
            .unwrap();

        let nodes = f.tracker.list_nodes();
        assert_eq!(nodes.len(), 1);
        let node = &nodes[0];
        assert_eq!(node.state, NodeState::Online);
        assert_eq!(node.effective_capacity, 6);
        assert_eq!(node.agents, 1);
        assert_eq!(node.last_usage.map(|u| u.cpu_percent), Some(30.0));
    }

    struct Tagged;

    impl AgentFactory for Tagged {
        fn deploy_payload(&self, placement: &AgentPlacement) -> serde_json::Value {
            json!({"agent_id": placement.agent_id, "runtime": "sandbox"})
        }
    }

    #[test]
    fn custom_factory_shapes_deploy_commands() {
        let f = fixture();
        let tracker = f.tracker.with_factory(Arc::new(Tagged));
        register(&tracker, "n1", 4);
        tracker
            .place_agent("A1", json!({"secret": 1}), &PlacementRequirements::default())
            .unwrap();

        let cmds = tracker.commands().poll("n1");
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].data, json!({"agent_id": "A1", "runtime": "sandbox"}));
    }
}
