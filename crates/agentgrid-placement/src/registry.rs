//! Placement registry — the durable agent → node mapping.
//!
//! All operations are short mutations of one in-memory table guarded by a
//! mutex. After a mutation the registry snapshots the table, releases the
//! lock, and hands the snapshot to a [`Persister`]; disk errors are logged
//! and never reach the caller.
//!
//! Failover is modelled with temporary placements: when a host dies its
//! agents are migrated with `temporary = true`, which records the first
//! host they were evicted from in `original_node_id`. That origin survives
//! further hops until the placement is made permanent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use agentgrid_state::{
    AgentPlacement, Clock, MemoryBackend, Persister, PlacementRecord, SystemClock, TableBackend,
};

use crate::error::{PlacementError, PlacementResult};
use crate::scorer::{self, NodeCapacity, PlacementRequirements};

type Table = BTreeMap<String, PlacementRecord>;

/// Thread-safe registry of agent placements.
pub struct PlacementRegistry {
    table: Mutex<Table>,
    persister: Persister<PlacementRecord>,
    clock: Arc<dyn Clock>,
}

impl PlacementRegistry {
    /// Open the registry, loading any rows the backend already holds.
    ///
    /// An unreadable backend yields an empty registry. Rows that break the
    /// temporary/original invariant are repaired to permanent placements.
    pub fn open(backend: Arc<dyn TableBackend<PlacementRecord>>, clock: Arc<dyn Clock>) -> Self {
        let persister = Persister::new(backend);
        let mut table = persister.load();

        for (agent_id, record) in table.iter_mut() {
            if !record.is_consistent() {
                warn!(
                    %agent_id,
                    node_id = %record.node_id,
                    original = ?record.original_node_id,
                    "repairing inconsistent placement row"
                );
                record.is_temporary = false;
                record.original_node_id = None;
            }
        }

        info!(
            backend = %persister.describe(),
            placements = table.len(),
            "placement registry opened"
        );

        Self {
            table: Mutex::new(table),
            persister,
            clock,
        }
    }

    /// An ephemeral registry (for testing).
    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryBackend::<PlacementRecord>::new()), Arc::new(SystemClock))
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` under the table lock; if it reports a change, persist the
    /// resulting snapshot after the lock is released.
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

    /// Create or overwrite the placement for `agent_id`.
    ///
    /// A temporary placement must name an original node different from
    /// `node_id`. For a permanent placement `original_node_id` is ignored.
    /// Last writer wins for concurrent registrations of the same id.
    pub fn register(
        &self,
        agent_id: &str,
        node_id: &str,
        config: serde_json::Value,
        temporary: bool,
        original_node_id: Option<&str>,
    ) -> PlacementResult<AgentPlacement> {
        let original = if temporary {
            match original_node_id {
                Some(original) if original != node_id => Some(original.to_string()),
                Some(_) => {
                    return Err(PlacementError::InvalidTemporary {
                        agent_id: agent_id.to_string(),
                        reason: "original node equals current node".to_string(),
                    });
                }
                None => {
                    return Err(PlacementError::InvalidTemporary {
                        agent_id: agent_id.to_string(),
                        reason: "original node missing".to_string(),
                    });
                }
            }
        } else {
            None
        };

        let record = PlacementRecord {
            node_id: node_id.to_string(),
            config,
            placed_at: self.clock.now_secs(),
            is_temporary: temporary,
            original_node_id: original,
        };
        let placement = AgentPlacement::from_record(agent_id, &record);

        let previous = self.mutate(|table| (table.insert(agent_id.to_string(), record), true));
        match previous {
            Some(prev) if prev.node_id != node_id => info!(
                %agent_id,
                from = %prev.node_id,
                to = %node_id,
                "placement overwritten"
            ),
            _ => info!(%agent_id, %node_id, temporary, "agent placed"),
        }
        Ok(placement)
    }

    /// Remove the placement. Absent agents are a no-op.
    pub fn unregister(&self, agent_id: &str) -> Option<AgentPlacement> {
        let removed = self.mutate(|table| {
            let removed = table.remove(agent_id);
            let changed = removed.is_some();
            (removed, changed)
        });
        match &removed {
            Some(record) => info!(%agent_id, node_id = %record.node_id, "agent unplaced"),
            None => debug!(%agent_id, "unregister of unplaced agent"),
        }
        removed.map(|record| AgentPlacement::from_record(agent_id, &record))
    }

    /// The node currently hosting `agent_id`.
    pub fn locate(&self, agent_id: &str) -> Option<String> {
        self.lock().get(agent_id).map(|r| r.node_id.clone())
    }

    /// Full placement for `agent_id`.
    pub fn get(&self, agent_id: &str) -> Option<AgentPlacement> {
        self.lock()
            .get(agent_id)
            .map(|r| AgentPlacement::from_record(agent_id, r))
    }

    /// All placements, ordered by agent id.
    pub fn list(&self) -> Vec<AgentPlacement> {
        self.lock()
            .iter()
            .map(|(id, r)| AgentPlacement::from_record(id, r))
            .collect()
    }

    /// Agents currently hosted on `node_id`.
    pub fn list_by_node(&self, node_id: &str) -> BTreeSet<String> {
        self.lock()
            .iter()
            .filter(|(_, r)| r.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of agents per hosting node.
    pub fn count_by_node(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for record in self.lock().values() {
            *counts.entry(record.node_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick a host among `candidates`; see [`scorer::choose_node`].
    pub fn choose_node(
        &self,
        candidates: &HashMap<String, NodeCapacity>,
        requirements: &PlacementRequirements,
    ) -> Option<String> {
        scorer::choose_node(candidates, requirements)
    }

    /// Move an agent to `new_node_id`.
    ///
    /// With `temporary = true` the first eviction records the current host as
    /// `original_node_id`; later temporary hops keep that origin. Landing back
    /// on the origin, or migrating with `temporary = false`, makes the
    /// placement permanent. Migrating to the current host changes nothing.
    pub fn migrate(
        &self,
        agent_id: &str,
        new_node_id: &str,
        temporary: bool,
    ) -> PlacementResult<AgentPlacement> {
        let now = self.clock.now_secs();
        let outcome = self.mutate(|table| {
            let Some(record) = table.get_mut(agent_id) else {
                return (None, false);
            };
            if record.node_id == new_node_id {
                return (Some((record.clone(), None)), false);
            }

            let from = std::mem::replace(&mut record.node_id, new_node_id.to_string());
            record.placed_at = now;

            if temporary {
                if !record.is_temporary {
                    record.is_temporary = true;
                    record.original_node_id = Some(from.clone());
                }
                if record.original_node_id.as_deref() == Some(new_node_id) {
                    record.is_temporary = false;
                    record.original_node_id = None;
                }
            } else {
                record.is_temporary = false;
                record.original_node_id = None;
            }

            (Some((record.clone(), Some(from))), true)
        });

        match outcome {
            Some((record, Some(from))) => {
                info!(
                    %agent_id,
                    %from,
                    to = %new_node_id,
                    temporary = record.is_temporary,
                    original = ?record.original_node_id,
                    "agent migrated"
                );
                Ok(AgentPlacement::from_record(agent_id, &record))
            }
            Some((record, None)) => {
                debug!(%agent_id, node_id = %new_node_id, "migrate to current host ignored");
                Ok(AgentPlacement::from_record(agent_id, &record))
            }
            None => Err(PlacementError::NotFound(agent_id.to_string())),
        }
    }

    /// Accept the current host as the agent's home.
    ///
    /// Idempotent: a permanent placement is returned unchanged.
    pub fn mark_permanent(&self, agent_id: &str) -> PlacementResult<AgentPlacement> {
        let outcome = self.mutate(|table| {
            let Some(record) = table.get_mut(agent_id) else {
                return (None, false);
            };
            let changed = record.is_temporary || record.original_node_id.is_some();
            record.is_temporary = false;
            record.original_node_id = None;
            (Some(record.clone()), changed)
        });

        let record = outcome.ok_or_else(|| PlacementError::NotFound(agent_id.to_string()))?;
        debug!(%agent_id, node_id = %record.node_id, "placement is permanent");
        Ok(AgentPlacement::from_record(agent_id, &record))
    }

    /// Placements whose current host is `dead_node_id`, temporary or not.
    pub fn list_orphans(&self, dead_node_id: &str) -> Vec<AgentPlacement> {
        self.lock()
            .iter()
            .filter(|(_, r)| r.node_id == dead_node_id)
            .map(|(id, r)| AgentPlacement::from_record(id, r))
            .collect()
    }

    /// Agents temporarily relocated away from `original_node_id`.
    pub fn list_temporary_from(&self, original_node_id: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, r)| r.is_temporary && r.original_node_id.as_deref() == Some(original_node_id))
            .map(|(id, _)| id.clone())
            .collect()
    }
}
