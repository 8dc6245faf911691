//! REST API handlers.
//!
//! Each handler calls into the `NodeHeartbeatTracker` (and through it the
//! placement registry, capacity learner and command queue) and returns a
//! JSON envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use agentgrid_capacity::DeviceStats;
use agentgrid_cluster::{
    AckRequest, ApiResponse, ClusterError, EnqueueRequest, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, RegisterResponse,
};
use agentgrid_placement::{PlacementError, PlacementRequirements};

use crate::ApiState;

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse::ok(data)).into_response()
}

fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse::ok(data))).into_response()
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (status, Json(ApiResponse::<()>::err(msg))).into_response()
}

/// Map a domain error onto an HTTP status.
fn cluster_error(e: &ClusterError) -> Response {
    let status = match e {
        ClusterError::UnknownNode(_) | ClusterError::UnknownCommand { .. } => StatusCode::NOT_FOUND,
        ClusterError::Placement(PlacementError::NotFound(_)) => StatusCode::NOT_FOUND,
        ClusterError::Placement(PlacementError::InvalidTemporary { .. }) => StatusCode::CONFLICT,
        ClusterError::Placement(PlacementError::CapacityExhausted) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    error_response(&e.to_string(), status)
}

fn respond<T: Serialize>(result: Result<T, ClusterError>) -> Response {
    match result {
        Ok(data) => ok(data),
        Err(e) => cluster_error(&e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// POST /api/v1/nodes/register
pub async fn register_node(
    State(state): State<ApiState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let outcome = state.tracker.register(
        &req.node_id,
        &req.device_type,
        req.resources,
        req.capabilities,
    );
    ok(RegisterResponse {
        node_id: req.node_id,
        state: outcome.state,
        heartbeat_interval_secs: state.tracker.config().heartbeat_interval.as_secs(),
        recovered: outcome.recovered,
    })
}

/// POST /api/v1/nodes/:id/heartbeat
///
/// Recording the sample persists the capacity table, so it runs on the
/// blocking pool.
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    if req.node_id != id {
        debug!(path = %id, body = %req.node_id, "heartbeat body names another node, using path");
    }
    let tracker = state.tracker.clone();
    let node_id = id.clone();
    let outcome =
        match tokio::task::spawn_blocking(move || tracker.heartbeat(&node_id, &req)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(node_id = %id, error = %e, "heartbeat task failed");
                return error_response("heartbeat failed", StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
    ok(HeartbeatResponse {
        acknowledged: outcome.acknowledged,
        reregister: outcome.reregister,
        pending_commands: state.tracker.commands().pending_count(&id),
    })
}

/// DELETE /api/v1/nodes/:id
pub async fn deregister_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.tracker.deregister(&id))
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Response {
    ok(state.tracker.list_nodes())
}

/// GET /api/v1/nodes/:id/commands
pub async fn poll_commands(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    ok(state.tracker.commands().poll(&id))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Enqueued {
    pub command_id: String,
}

/// POST /api/v1/nodes/:id/commands
pub async fn enqueue_command(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<EnqueueRequest>,
) -> Response {
    if state.tracker.node_state(&id).is_none() {
        return cluster_error(&ClusterError::UnknownNode(id));
    }
    let command_id = state.tracker.commands().enqueue(&id, req.kind, req.data);
    created(Enqueued { command_id })
}

/// POST /api/v1/nodes/:id/commands/:cmd/ack
pub async fn ack_command(
    State(state): State<ApiState>,
    Path((id, cmd)): Path<(String, String)>,
    Json(req): Json<AckRequest>,
) -> Response {
    respond(
        state
            .tracker
            .commands()
            .acknowledge(&id, &cmd, req.success, req.message.as_deref()),
    )
}

/// GET /api/v1/nodes/:id/recovery
pub async fn recovery_offer(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    ok(state.tracker.recovery_offer(&id))
}

// ── Placements ─────────────────────────────────────────────────

/// GET /api/v1/placements
pub async fn list_placements(State(state): State<ApiState>) -> Response {
    ok(state.tracker.registry().list())
}

/// Place request body.
#[derive(Debug, Deserialize)]
pub struct PlaceRequest {
    pub agent_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub requirements: PlacementRequirements,
}

/// POST /api/v1/placements
pub async fn place_agent(State(state): State<ApiState>, Json(req): Json<PlaceRequest>) -> Response {
    match state
        .tracker
        .place_agent(&req.agent_id, req.config, &req.requirements)
    {
        Ok(placement) => created(placement),
        Err(e) => cluster_error(&e),
    }
}

/// GET /api/v1/placements/:id
pub async fn get_placement(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.tracker.registry().get(&id) {
        Some(placement) => ok(placement),
        None => error_response("agent not placed", StatusCode::NOT_FOUND),
    }
}

/// DELETE /api/v1/placements/:id
pub async fn remove_placement(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.tracker.remove_agent(&id))
}

/// Migrate request body.
#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub node_id: String,
    #[serde(default)]
    pub temporary: bool,
}

/// POST /api/v1/placements/:id/migrate
pub async fn migrate_placement(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<MigrateRequest>,
) -> Response {
    respond(state.tracker.migrate_agent(&id, &req.node_id, req.temporary))
}

/// POST /api/v1/placements/:id/permanent
pub async fn mark_permanent(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.tracker.accept_relocation(&id))
}

/// POST /api/v1/placements/:id/return
pub async fn return_home(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    respond(state.tracker.return_home(&id))
}

// ── Capacity ───────────────────────────────────────────────────

/// GET /api/v1/capacity
pub async fn capacity_stats(State(state): State<ApiState>) -> Response {
    ok(state.tracker.learner().get_stats())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CapacityView {
    pub device_type: String,
    pub overbooking_factor: f64,
    pub stats: Option<DeviceStats>,
}

/// GET /api/v1/capacity/:device_type
pub async fn capacity_for(
    State(state): State<ApiState>,
    Path(device_type): Path<String>,
) -> Response {
    let learner = state.tracker.learner();
    let overbooking_factor = learner.get_factor(&device_type);
    let stats = learner.get_stats().remove(&device_type);
    ok(CapacityView {
        device_type,
        overbooking_factor,
        stats,
    })
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> Response {
    ok(serde_json::json!({
        "status": "ok",
        "nodes": state.tracker.list_nodes().len(),
        "placements": state.tracker.registry().len(),
    }))
}
