//! Node agent — the node-host side of the control-plane channel.
//!
//! Registers with the control plane over HTTP, heartbeats on the cadence
//! the control plane hands back, and pulls commands after every heartbeat.
//! Every request has a bounded timeout; failures are retried with
//! exponential backoff and never end the loop.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use agentgrid_state::NodeResources;

use crate::payloads::{
    AckRequest, AgentStatus, ApiResponse, Command, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, RegisterResponse, ResourceUsage,
};

/// Configuration for the node agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the control plane, e.g. `http://10.0.0.1:8080`.
    pub control_plane_url: String,
    pub node_id: String,
    pub device_type: String,
    pub resources: NodeResources,
    pub capabilities: HashMap<String, serde_json::Value>,
    /// Timeout applied to every request.
    pub request_timeout: Duration,
}

/// Executes commands on the node and reports what is running.
pub trait CommandHandler: Send + Sync {
    /// Apply one command. An error is reported back in the acknowledgement.
    fn handle(&self, command: &Command) -> Result<()>;

    /// Status of every agent on this node, keyed by agent id.
    fn agents_status(&self) -> HashMap<String, AgentStatus>;

    /// Current host resource usage.
    fn resources_usage(&self) -> ResourceUsage;
}

/// Exponential retry delay: 1s doubling to a 60s cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now; doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// HTTP client for one node host.
pub struct NodeAgent {
    config: AgentConfig,
    client: Client,
    base: String,
}

impl NodeAgent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .context("failed to create HTTP client")?;
        let base = format!("{}/api/v1", config.control_plane_url.trim_end_matches('/'));
        Ok(Self {
            config,
            client,
            base,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let envelope: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("invalid response body (HTTP {status})"))?;
        match envelope {
            ApiResponse {
                success: true,
                data: Some(data),
                ..
            } => Ok(data),
            ApiResponse { error, .. } => anyhow::bail!(
                "control plane error ({status}): {}",
                error.unwrap_or_else(|| "no data".to_string())
            ),
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{path}", self.base);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        Self::decode(response).await
    }

    /// Register this node. Returns the control plane's answer, including
    /// any agents offered back after a failover.
    pub async fn register(&self) -> Result<RegisterResponse> {
        let request = RegisterRequest {
            node_id: self.config.node_id.clone(),
            device_type: self.config.device_type.clone(),
            resources: self.config.resources,
            capabilities: self.config.capabilities.clone(),
        };
        let response: RegisterResponse = self.post("/nodes/register", &request).await?;
        info!(
            node_id = %response.node_id,
            state = ?response.state,
            heartbeat_interval_secs = response.heartbeat_interval_secs,
            recovered = response.recovered.as_ref().map_or(0, |r| r.agent_ids.len()),
            "registered with control plane"
        );
        Ok(response)
    }

    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let path = format!("/nodes/{}/heartbeat", self.config.node_id);
        self.post(&path, request).await
    }

    /// Fetch and take ownership of all pending commands.
    pub async fn poll_commands(&self) -> Result<Vec<Command>> {
        let url = format!("{}/nodes/{}/commands", self.base, self.config.node_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        Self::decode(response).await
    }

    pub async fn acknowledge(
        &self,
        command_id: &str,
        success: bool,
        message: Option<String>,
    ) -> Result<()> {
        let path = format!("/nodes/{}/commands/{command_id}/ack", self.config.node_id);
        let _: serde_json::Value = self
            .post(&path, &AckRequest { success, message })
            .await?;
        Ok(())
    }

    /// Leave the fleet; the control plane relocates this node's agents.
    pub async fn deregister(&self) -> Result<()> {
        let url = format!("{}/nodes/{}", self.base, self.config.node_id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("DELETE {url} failed"))?;
        let _: serde_json::Value = Self::decode(response).await?;
        info!(node_id = %self.config.node_id, "deregistered from control plane");
        Ok(())
    }

    fn build_heartbeat<H: CommandHandler + ?Sized>(&self, handler: &H) -> HeartbeatRequest {
        let agents_status = handler.agents_status();
        HeartbeatRequest {
            node_id: self.config.node_id.clone(),
            status: "online".to_string(),
            agents_count: agents_status.len() as u32,
            agents_status,
            resources_usage: handler.resources_usage(),
            latency_ms: 0.0,
        }
    }

    /// Heartbeat, then drain and execute commands.
    ///
    /// Returns `Ok(false)` when the control plane asked for re-registration.
    async fn tick<H: CommandHandler + ?Sized>(&self, handler: &H) -> Result<bool> {
        let response = self.heartbeat(&self.build_heartbeat(handler)).await?;
        if response.reregister {
            warn!(node_id = %self.config.node_id, "control plane asked for re-registration");
            return Ok(false);
        }
        debug!(
            node_id = %self.config.node_id,
            pending = response.pending_commands,
            "heartbeat acknowledged"
        );

        // Polled commands are no longer queued on the control plane, so all
        // of them run before any acknowledgement can fail.
        let commands = self.poll_commands().await?;
        let outcomes: Vec<(String, Option<String>)> = commands
            .iter()
            .map(|command| {
                let error = handler.handle(command).err().map(|e| e.to_string());
                if let Some(e) = &error {
                    warn!(command_id = %command.id, kind = %command.kind, error = %e, "command failed");
                }
                (command.id.clone(), error)
            })
            .collect();

        for (command_id, error) in outcomes {
            let success = error.is_none();
            if let Err(e) = self.acknowledge(&command_id, success, error).await {
                warn!(%command_id, error = %e, "acknowledgement not delivered");
            }
        }
        Ok(true)
    }

    /// Run until `shutdown` fires: register, heartbeat, execute commands.
    pub async fn run<H: CommandHandler + ?Sized>(
        &self,
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let node_id = self.config.node_id.clone();
        let mut backoff = Backoff::default();
        let mut interval: Option<Duration> = None;

        loop {
            let result = match interval {
                None => self.register().await.map(|response| {
                    interval = Some(Duration::from_secs(response.heartbeat_interval_secs.max(1)));
                }),
                Some(_) => self.tick(handler).await.map(|registered| {
                    if !registered {
                        interval = None;
                    }
                }),
            };

            let delay = match result {
                Ok(()) => {
                    backoff.reset();
                    // Re-register immediately when asked to.
                    interval.unwrap_or(Duration::ZERO)
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(%node_id, error = %e, retry_in = ?delay, "control plane unreachable");
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!(%node_id, "node agent shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}
