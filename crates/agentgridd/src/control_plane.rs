//! Control plane mode.
//!
//! In this mode, the daemon:
//! 1. Opens the placement and capacity tables through the configured backend
//! 2. Builds the registry, learner, command queue and heartbeat tracker
//! 3. Runs the liveness loop in the background
//! 4. Serves the REST API until Ctrl-C

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use agentgrid_capacity::CapacityLearner;
use agentgrid_cluster::{CommandQueue, NodeHeartbeatTracker, run_liveness_loop};
use agentgrid_placement::PlacementRegistry;
use agentgrid_state::tables::{CAPACITY, PLACEMENTS, json_file_name};
use agentgrid_state::{
    Clock, JsonFileBackend, PlacementRecord, ProfileRecord, RedbBackend, SystemClock,
    TableBackend,
};

use crate::config::{DaemonConfig, StorageKind};

type Backends = (
    Arc<dyn TableBackend<PlacementRecord>>,
    Arc<dyn TableBackend<ProfileRecord>>,
);

/// Open both tables under `data_dir`.
fn open_backends(config: &DaemonConfig) -> anyhow::Result<Backends> {
    let data_dir = &config.storage.data_dir;
    std::fs::create_dir_all(data_dir)?;

    match config.storage.backend {
        StorageKind::Json => {
            let placements = data_dir.join(json_file_name(PLACEMENTS));
            let capacity = data_dir.join(json_file_name(CAPACITY));
            info!(?placements, ?capacity, "json tables selected");
            Ok((
                Arc::new(JsonFileBackend::<PlacementRecord>::new(placements)),
                Arc::new(JsonFileBackend::<ProfileRecord>::new(capacity)),
            ))
        }
        StorageKind::Redb => {
            let db_path = data_dir.join("agentgrid.redb");
            let placements = RedbBackend::<PlacementRecord>::open_or_recover(&db_path, PLACEMENTS)?;
            let capacity = RedbBackend::<ProfileRecord>::with_database(placements.database(), CAPACITY)?;
            info!(path = ?db_path, "redb state store opened");
            Ok((Arc::new(placements), Arc::new(capacity)))
        }
    }
}

/// Assemble the tracker and everything it drives.
pub fn build_tracker(config: &DaemonConfig) -> anyhow::Result<Arc<NodeHeartbeatTracker>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (placements, capacity) = open_backends(config)?;

    let registry = Arc::new(PlacementRegistry::open(placements, clock.clone()));
    let learner = Arc::new(CapacityLearner::open(
        capacity,
        clock.clone(),
        config.learner_config()?,
    ));
    let commands = Arc::new(CommandQueue::new());

    Ok(Arc::new(NodeHeartbeatTracker::new(
        registry,
        learner,
        commands,
        clock,
        config.liveness_config()?,
    )))
}

/// Run the control plane.
pub async fn run_control_plane(config: DaemonConfig) -> anyhow::Result<()> {
    info!("AgentGrid daemon starting in control-plane mode");

    let tracker = build_tracker(&config)?;
    info!(
        placements = tracker.registry().len(),
        liveness = ?tracker.config(),
        "tracker initialized"
    );

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let liveness_handle = tokio::spawn(run_liveness_loop(tracker.clone(), shutdown_rx));

    // ── REST API server ──────────────────────────────────────────
    let router = agentgrid_api::build_router(tracker);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;
    let _ = liveness_handle.await;

    info!("control plane stopped");
    Ok(())
}
