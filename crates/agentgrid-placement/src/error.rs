//! Placement error types.

use thiserror::Error;

/// Errors returned by placement operations.
///
/// Persistence failures are not represented here: they are logged by the
/// registry and never surface to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("agent not placed: {0}")]
    NotFound(String),

    #[error("no candidate node has a free slot")]
    CapacityExhausted,

    #[error("invalid temporary placement for {agent_id}: {reason}")]
    InvalidTemporary { agent_id: String, reason: String },
}

pub type PlacementResult<T> = Result<T, PlacementError>;
