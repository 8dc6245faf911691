//! agentgrid-cluster — fleet liveness and the orchestrator/node channel.
//!
//! Node hosts register with the control plane, heartbeat on a fixed
//! cadence, and pull commands from a per-node queue. Heartbeats feed load
//! samples to the capacity learner; silence past the liveness thresholds
//! marks a node dead and relocates its agents.
//!
//! # Architecture
//!
//! ```text
//! Control Plane
//!   ├── NodeHeartbeatTracker
//!   │   ├── register()      → Registered (recovery offer if it was dead)
//!   │   ├── heartbeat()     → Online, sample → CapacityLearner
//!   │   ├── check_liveness() → Suspect / Dead
//!   │   └── mark_dead()     → orphans → choose_node → migrate(temporary)
//!   ├── CommandQueue        (per-node FIFO, at-most-once)
//!   └── run_liveness_loop   (periodic check_liveness)
//!
//! Node Host
//!   └── NodeAgent (HTTP)
//!       ├── register / heartbeat / poll / ack
//!       └── CommandHandler executes deploy/destroy/update
//! ```

pub mod agent;
pub mod commands;
pub mod error;
pub mod liveness;
pub mod payloads;
pub mod tracker;

pub use agent::{AgentConfig, Backoff, CommandHandler, NodeAgent};
pub use commands::CommandQueue;
pub use error::{ClusterError, ClusterResult};
pub use liveness::run_liveness_loop;
pub use payloads::*;
pub use tracker::{
    DeathReport, HeartbeatOutcome, LivenessConfig, NodeHeartbeatTracker, NodeView,
    RegisterOutcome, Relocation, Transition,
};
