//! Per-node command queue.
//!
//! Delivery is at-most-once: `poll` moves pending commands to an in-flight
//! set and never hands them out again. `acknowledge` closes an in-flight
//! command. Nothing is persisted, so commands queued for a node are lost
//! on control-plane restart.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::payloads::{Command, CommandKind};

#[derive(Default)]
struct Queues {
    next_id: u64,
    pending: HashMap<String, VecDeque<Command>>,
    in_flight: HashMap<String, HashMap<String, Command>>,
}

/// Pull-based command delivery keyed by node id.
#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<Queues>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a command for `node_id` and return its id.
    pub fn enqueue(&self, node_id: &str, kind: CommandKind, data: serde_json::Value) -> String {
        let mut queues = self.lock();
        queues.next_id += 1;
        let id = format!("cmd-{}", queues.next_id);
        queues
            .pending
            .entry(node_id.to_string())
            .or_default()
            .push_back(Command {
                id: id.clone(),
                kind,
                data,
            });
        debug!(%node_id, command_id = %id, %kind, "command queued");
        id
    }

    /// Hand out every pending command for `node_id`, oldest first.
    pub fn poll(&self, node_id: &str) -> Vec<Command> {
        let mut queues = self.lock();
        let Some(pending) = queues.pending.remove(node_id) else {
            return Vec::new();
        };
        let commands: Vec<Command> = pending.into_iter().collect();
        let in_flight = queues.in_flight.entry(node_id.to_string()).or_default();
        for command in &commands {
            in_flight.insert(command.id.clone(), command.clone());
        }
        debug!(%node_id, count = commands.len(), "commands delivered");
        commands
    }

    /// Close an in-flight command.
    pub fn acknowledge(
        &self,
        node_id: &str,
        command_id: &str,
        success: bool,
        message: Option<&str>,
    ) -> ClusterResult<Command> {
        let mut queues = self.lock();
        let command = queues
            .in_flight
            .get_mut(node_id)
            .and_then(|in_flight| in_flight.remove(command_id))
            .ok_or_else(|| ClusterError::UnknownCommand {
                node_id: node_id.to_string(),
                command_id: command_id.to_string(),
            })?;

        if success {
            info!(%node_id, %command_id, kind = %command.kind, "command completed");
        } else {
            warn!(
                %node_id,
                %command_id,
                kind = %command.kind,
                message = message.unwrap_or(""),
                "command failed on node"
            );
        }
        Ok(command)
    }

    /// Commands queued for `node_id` and not yet polled.
    pub fn pending_count(&self, node_id: &str) -> usize {
        self.lock().pending.get(node_id).map_or(0, VecDeque::len)
    }

    /// Commands polled by `node_id` and not yet acknowledged.
    pub fn in_flight_count(&self, node_id: &str) -> usize {
        self.lock().in_flight.get(node_id).map_or(0, HashMap::len)
    }

    /// Discard everything queued or in flight for `node_id`.
    ///
    /// Returns the number of commands dropped.
    pub fn discard(&self, node_id: &str) -> usize {
        let mut queues = self.lock();
        let pending = queues.pending.remove(node_id).map_or(0, |q| q.len());
        let in_flight = queues.in_flight.remove(node_id).map_or(0, |m| m.len());
        if pending + in_flight > 0 {
            warn!(%node_id, pending, in_flight, "discarding undelivered commands");
        }
        pending + in_flight
    }
}
