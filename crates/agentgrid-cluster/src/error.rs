//! Cluster error types.

use agentgrid_placement::PlacementError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("command {command_id} is not in flight for node {node_id}")]
    UnknownCommand { node_id: String, command_id: String },

    #[error(transparent)]
    Placement(#[from] PlacementError),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
