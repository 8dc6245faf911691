//! agentgridd — the AgentGrid daemon.
//!
//! One binary, two roles:
//! - `control-plane`: placement registry, capacity learner, node liveness
//!   and the REST API
//! - `node`: a node host that registers, heartbeats and runs agents
//!
//! # Usage
//!
//! ```text
//! agentgridd control-plane --config /etc/agentgrid/agentgrid.toml
//! agentgridd node --control-plane http://10.0.0.1:8080 --node-id rpi-07 \
//!     --device-type rpi4_a --max-agents 8
//! ```

mod config;
mod control_plane;
mod node_mode;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{DaemonConfig, StorageKind};
use crate::node_mode::NodeSettings;

#[derive(Parser)]
#[command(name = "agentgridd", about = "AgentGrid daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (placement, capacity, liveness, REST API).
    ControlPlane {
        /// Path to agentgrid.toml. Missing file means defaults.
        #[arg(long)]
        config: Option<PathBuf>,

        /// API port (overrides `[server] port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory (overrides `[storage] data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Storage backend (overrides `[storage] backend`).
        #[arg(long, value_enum)]
        storage: Option<StorageKind>,
    },

    /// Run a node host that executes agents for the control plane.
    Node {
        /// Control plane base URL.
        #[arg(long)]
        control_plane: String,

        /// Unique node id.
        #[arg(long)]
        node_id: String,

        /// Device class used for capacity learning, e.g. `rpi4_a`.
        #[arg(long)]
        device_type: String,

        /// Nominal agent capacity before overbooking.
        #[arg(long)]
        max_agents: u32,

        /// CPU cores to advertise (default: detected).
        #[arg(long)]
        cpu_cores: Option<u32>,

        /// Memory in GB to advertise (default: from /proc/meminfo).
        #[arg(long)]
        memory_gb: Option<f64>,

        /// Disk in GB to advertise.
        #[arg(long, default_value = "0")]
        disk_gb: f64,

        /// Per-request timeout in seconds.
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,agentgrid=debug,agentgridd=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::ControlPlane {
            config,
            port,
            data_dir,
            storage,
        } => {
            let mut daemon_config = DaemonConfig::load(config.as_deref())?;
            if let Some(port) = port {
                daemon_config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                daemon_config.storage.data_dir = data_dir;
            }
            if let Some(storage) = storage {
                daemon_config.storage.backend = storage;
            }
            control_plane::run_control_plane(daemon_config).await
        }
        Command::Node {
            control_plane,
            node_id,
            device_type,
            max_agents,
            cpu_cores,
            memory_gb,
            disk_gb,
            timeout,
        } => {
            node_mode::run_node(NodeSettings {
                control_plane_url: control_plane,
                node_id,
                device_type,
                max_agents,
                cpu_cores,
                memory_gb,
                disk_gb,
                request_timeout: Duration::from_secs(timeout.max(1)),
            })
            .await
        }
    }
}
