//! agentgrid-state — persisted state for AgentGrid.
//!
//! Holds the two durable tables of the orchestrator (agent placements and
//! per-device-class capacity profiles) and the pluggable backends they are
//! written through.
//!
//! # Architecture
//!
//! ```text
//! PlacementRegistry / CapacityLearner
//!   └── Persister<V>            (ordered, best-effort, outside the table lock)
//!       └── dyn TableBackend<V>
//!           ├── JsonFileBackend  (one JSON object per file)
//!           ├── RedbBackend      (one redb table, JSON values)
//!           └── MemoryBackend    (tests)
//! ```
//!
//! Every table is a `BTreeMap<String, V>` keyed by agent id or device type.
//! A backend that fails to load is treated as empty state: startup never
//! fails on corrupt or missing files.

pub mod backend;
pub mod clock;
pub mod error;
pub mod persister;
pub mod redb_backend;
pub mod tables;
pub mod types;

pub use backend::{JsonFileBackend, MemoryBackend, TableBackend, load_or_empty};
pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use error::{StateError, StateResult};
pub use persister::Persister;
pub use redb_backend::RedbBackend;
pub use types::*;
