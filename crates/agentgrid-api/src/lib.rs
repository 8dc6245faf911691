//! agentgrid-api — REST API for AgentGrid.
//!
//! Node hosts use it to register, heartbeat and pull commands; operators
//! and the agent subsystem use it to place agents and inspect capacity.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/nodes/register` | Register a node host |
//! | POST | `/api/v1/nodes/{id}/heartbeat` | Heartbeat with agent status and usage |
//! | DELETE | `/api/v1/nodes/{id}` | Deregister a node (agents relocated) |
//! | GET | `/api/v1/nodes` | List nodes |
//! | GET | `/api/v1/nodes/{id}/commands` | Take pending commands |
//! | POST | `/api/v1/nodes/{id}/commands` | Queue a command |
//! | POST | `/api/v1/nodes/{id}/commands/{cmd}/ack` | Acknowledge a command |
//! | GET | `/api/v1/nodes/{id}/recovery` | Agents relocated away from a node |
//! | GET | `/api/v1/placements` | List placements |
//! | POST | `/api/v1/placements` | Place an agent |
//! | GET | `/api/v1/placements/{id}` | Get a placement |
//! | DELETE | `/api/v1/placements/{id}` | Remove a placement |
//! | POST | `/api/v1/placements/{id}/migrate` | Move an agent |
//! | POST | `/api/v1/placements/{id}/permanent` | Accept a relocation |
//! | POST | `/api/v1/placements/{id}/return` | Move an agent back home |
//! | GET | `/api/v1/capacity` | Capacity stats per device class |
//! | GET | `/api/v1/capacity/{device_type}` | Factor and stats for one class |
//! | GET | `/healthz` | Control-plane health |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use agentgrid_cluster::NodeHeartbeatTracker;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub tracker: Arc<NodeHeartbeatTracker>,
}

/// Build the complete API router.
pub fn build_router(tracker: Arc<NodeHeartbeatTracker>) -> Router {
    let state = ApiState { tracker };

    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/register", post(handlers::register_node))
        .route("/nodes/{id}", axum::routing::delete(handlers::deregister_node))
        .route("/nodes/{id}/heartbeat", post(handlers::heartbeat))
        .route("/nodes/{id}/commands", get(handlers::poll_commands).post(handlers::enqueue_command))
        .route("/nodes/{id}/commands/{cmd}/ack", post(handlers::ack_command))
        .route("/nodes/{id}/recovery", get(handlers::recovery_offer))
        .route("/placements", get(handlers::list_placements).post(handlers::place_agent))
        .route("/placements/{id}", get(handlers::get_placement).delete(handlers::remove_placement))
        .route("/placements/{id}/migrate", post(handlers::migrate_placement))
        .route("/placements/{id}/permanent", post(handlers::mark_permanent))
        .route("/placements/{id}/return", post(handlers::return_home))
        .route("/capacity", get(handlers::capacity_stats))
        .route("/capacity/{device_type}", get(handlers::capacity_for))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz).with_state(state))
}
