//! Node scoring for placement decisions.
//!
//! Each candidate is scored on free slots, with a small bonus for nodes that
//! are proportionally emptier:
//!
//! ```text
//! available = max_agents - current_count        (skip if <= 0)
//! score     = available * 100 + (1 - current_count / max_agents) * 50
//! ```
//!
//! Ties go to the lexicographically smallest node id, so the choice never
//! depends on map iteration order.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Slot accounting for one candidate node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    /// Effective capacity (raw slots after overbooking).
    pub max_agents: u32,
    /// Agents currently placed on the node.
    pub current_count: u32,
}

impl NodeCapacity {
    pub fn new(max_agents: u32, current_count: u32) -> Self {
        Self {
            max_agents,
            current_count,
        }
    }

    /// Free slots; negative when the node is over capacity.
    pub fn available(&self) -> i64 {
        i64::from(self.max_agents) - i64::from(self.current_count)
    }
}

/// Requirements attached to a placement request.
///
/// Accepted and logged, but not used to filter candidates yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementRequirements {
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl PlacementRequirements {
    pub fn is_empty(&self) -> bool {
        !self.gpu && self.labels.is_empty()
    }
}

/// Scored placement result for a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node_id: String,
    pub score: f64,
    pub available: i64,
}

/// Score one candidate, or `None` if it has no free slot.
pub fn score_node(capacity: &NodeCapacity) -> Option<f64> {
    let available = capacity.available();
    if available <= 0 {
        return None;
    }
    // available > 0 implies max_agents > 0.
    let fill = f64::from(capacity.current_count) / f64::from(capacity.max_agents);
    Some(available as f64 * 100.0 + (1.0 - fill) * 50.0)
}

/// Score all candidates and return them best first.
pub fn rank_nodes(candidates: &HashMap<String, NodeCapacity>) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = candidates
        .iter()
        .filter_map(|(node_id, capacity)| {
            score_node(capacity).map(|score| NodeScore {
                node_id: node_id.clone(),
                score,
                available: capacity.available(),
            })
        })
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    scores
}

/// Pick the best node for a new agent, or `None` when every candidate is full.
pub fn choose_node(
    candidates: &HashMap<String, NodeCapacity>,
    requirements: &PlacementRequirements,
) -> Option<String> {
    if !requirements.is_empty() {
        debug!(
            gpu = requirements.gpu,
            labels = requirements.labels.len(),
            "placement requirements are advisory, not filtering"
        );
    }

    let ranked = rank_nodes(candidates);
    let best = ranked.into_iter().next()?;
    debug!(
        node = %best.node_id,
        score = best.score,
        available = best.available,
        candidates = candidates.len(),
        "node chosen"
    );
    Some(best.node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(entries: &[(&str, u32, u32)]) -> HashMap<String, NodeCapacity> {
        entries
            .iter()
            .map(|(id, max, cur)| (id.to_string(), NodeCapacity::new(*max, *cur)))
            .collect()
    }

    #[test]
    fn full_node_is_skipped() {
        let nodes = candidates(&[("n1", 10, 10), ("n2", 5, 2)]);
        let chosen = choose_node(&nodes, &PlacementRequirements::default());
        assert_eq!(chosen.as_deref(), Some("n2"));
    }

    #[test]
    fn all_full_returns_none() {
        let nodes = candidates(&[("n1", 3, 3), ("n2", 2, 5), ("n3", 0, 0)]);
        assert!(choose_node(&nodes, &PlacementRequirements::default()).is_none());
        assert!(choose_node(&HashMap::new(), &PlacementRequirements::default()).is_none());
    }

    #[test]
    fn score_formula() {
        // available = 3 → 300; fill = 2/5 → (1 - 0.4) * 50 = 30.
        let score = score_node(&NodeCapacity::new(5, 2)).unwrap();
        assert!((score - 330.0).abs() < 1e-9);
        assert!(score_node(&NodeCapacity::new(4, 4)).is_none());
        assert!(score_node(&NodeCapacity::new(0, 0)).is_none());
    }

    #[test]
    fn more_headroom_wins() {
        let nodes = candidates(&[("small", 4, 1), ("big", 20, 10)]);
        let chosen = choose_node(&nodes, &PlacementRequirements::default());
        assert_eq!(chosen.as_deref(), Some("big"));
    }

    #[test]
    fn ties_break_on_smallest_node_id() {
        let nodes = candidates(&[("node-c", 8, 2), ("node-a", 8, 2), ("node-b", 8, 2)]);
        for _ in 0..10 {
            let chosen = choose_node(&nodes, &PlacementRequirements::default());
            assert_eq!(chosen.as_deref(), Some("node-a"));
        }
    }

    #[test]
    fn requirements_do_not_filter() {
        let nodes = candidates(&[("n1", 4, 0)]);
        let req = PlacementRequirements {
            gpu: true,
            labels: HashMap::from([("arch".to_string(), "arm64".to_string())]),
        };
        assert_eq!(choose_node(&nodes, &req).as_deref(), Some("n1"));
    }

    #[test]
    fn rank_nodes_is_sorted_and_excludes_full() {
        let nodes = candidates(&[("a", 10, 9), ("b", 10, 0), ("c", 10, 5), ("d", 1, 1)]);
        let ranked = rank_nodes(&nodes);
        let ids: Vec<&str> = ranked.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn never_returns_node_without_slots() {
        // Deterministic sweep over small capacity grids.
        for max_a in 0..6u32 {
            for cur_a in 0..8u32 {
                for max_b in 0..6u32 {
                    for cur_b in 0..8u32 {
                        let nodes = candidates(&[("a", max_a, cur_a), ("b", max_b, cur_b)]);
                        if let Some(id) = choose_node(&nodes, &PlacementRequirements::default()) {
                            assert!(nodes[&id].available() > 0);
                        } else {
                            assert!(nodes.values().all(|c| c.available() <= 0));
                        }
                    }
                }
            }
        }
    }
}
