//! AgentGrid placement — which node hosts which agent.
//!
//! This crate owns the durable agent → node mapping and the node scoring
//! used to pick a host. It does NOT look up learned capacity: callers pass
//! each candidate's effective `max_agents` (raw capacity times the
//! overbooking factor from `agentgrid-capacity`).
//!
//! # Components
//!
//! - **`registry`** — `PlacementRegistry`: register, migrate, orphans, recovery
//! - **`scorer`** — `choose_node`: headroom scoring with a deterministic tie-break
//! - **`factory`** — `AgentFactory`: builds deploy payloads for placed agents

pub mod error;
pub mod factory;
pub mod registry;
pub mod scorer;

pub use error::{PlacementError, PlacementResult};
pub use factory::{AgentFactory, ConfigPassthrough};
pub use registry::PlacementRegistry;
pub use scorer::{NodeCapacity, PlacementRequirements, choose_node, score_node};
