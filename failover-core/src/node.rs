//! Async node driver
//!
//! Owns a [`FailoverEngine`] and feeds it from three sources: commands from
//! the transport or operator, child exits from the process spawner and a
//! periodic tick for timers. Everything runs on one task, so the engine is
//! never touched concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::abstractions::{ChildExit, Clock, ProcessSpawner, SystemClock, TokioProcessSpawner};
use crate::config::FailoverConfig;
use crate::engine::{FailoverEngine, OwnershipPhase};
use crate::error::{FailoverError, FailoverResult};
use crate::link::ClusterLink;
use crate::message::Envelope;
use crate::resource::ResourceClass;
use crate::standby::StandbyPhase;

#[derive(Debug)]
pub enum NodeCommand {
    /// A message received from the cluster, our own loopback included
    Message(Envelope),
    LinksUp { up_peers: Vec<String> },
    NodeDead(String),
    /// Operator asked us to go standby for `scope`
    Standby(ResourceClass),
    Status(oneshot::Sender<StatusReport>),
    Shutdown,
}

/// Point-in-time view of a node, served to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub node: String,
    pub phase: OwnershipPhase,
    pub held: ResourceClass,
    /// `held` as text once quiescent, `transition` otherwise
    pub resource_state: String,
    pub peer_held: ResourceClass,
    pub peer_stable: bool,
    pub standby: StandbyPhase,
    pub running_children: usize,
    pub pending_notifications: usize,
    pub shutdown_in_progress: bool,
    pub generated_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn from_engine(engine: &FailoverEngine, generated_at: DateTime<Utc>) -> Self {
        let peer = engine.peer_view();
        Self {
            node: engine.node_name().to_string(),
            phase: engine.phase(),
            held: engine.held(),
            resource_state: engine.resource_state().to_string(),
            peer_held: peer.held,
            peer_stable: peer.is_stable,
            standby: engine.standby().phase(),
            running_children: engine.running_children(),
            pending_notifications: engine.pending_notifications(),
            shutdown_in_progress: engine.shutdown_in_progress(),
            generated_at,
        }
    }
}

/// Cloneable handle for feeding a running [`FailoverNode`]
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::UnboundedSender<NodeCommand>,
}

impl NodeHandle {
    fn send(&self, command: NodeCommand) -> FailoverResult<()> {
        self.commands
            .send(command)
            .map_err(|_| FailoverError::DriverStopped {
                reason: "command channel closed".to_string(),
            })
    }

    pub fn deliver(&self, envelope: Envelope) -> FailoverResult<()> {
        self.send(NodeCommand::Message(envelope))
    }

    pub fn links_up(&self, up_peers: Vec<String>) -> FailoverResult<()> {
        self.send(NodeCommand::LinksUp { up_peers })
    }

    pub fn node_dead(&self, name: impl Into<String>) -> FailoverResult<()> {
        self.send(NodeCommand::NodeDead(name.into()))
    }

    pub fn request_standby(&self, scope: ResourceClass) -> FailoverResult<()> {
        self.send(NodeCommand::Standby(scope))
    }

    pub fn shutdown(&self) -> FailoverResult<()> {
        self.send(NodeCommand::Shutdown)
    }

    pub async fn status(&self) -> FailoverResult<StatusReport> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::Status(tx))?;
        rx.await.map_err(|_| FailoverError::DriverStopped {
            reason: "status reply dropped".to_string(),
        })
    }
}

pub struct FailoverNode {
    engine: FailoverEngine,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    exits: mpsc::UnboundedReceiver<ChildExit>,
    tick_interval: Duration,
}

impl FailoverNode {
    /// Node running real child processes against the system clock
    pub fn new(
        config: FailoverConfig,
        link: Arc<dyn ClusterLink>,
    ) -> FailoverResult<(Self, NodeHandle)> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(TokioProcessSpawner::new(exit_tx));
        Self::with_parts(config, Arc::new(SystemClock::new()), link, spawner, exit_rx)
    }

    /// Node with caller-supplied clock and spawner; `exits` must receive the
    /// spawner's completions
    pub fn with_parts(
        config: FailoverConfig,
        clock: Arc<dyn Clock>,
        link: Arc<dyn ClusterLink>,
        spawner: Arc<dyn ProcessSpawner>,
        exits: mpsc::UnboundedReceiver<ChildExit>,
    ) -> FailoverResult<(Self, NodeHandle)> {
        let tick_interval = config.timing.tick_interval;
        let engine = FailoverEngine::new(config, clock, link, spawner)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                engine,
                commands: rx,
                exits,
                tick_interval,
            },
            NodeHandle { commands: tx },
        ))
    }

    pub fn engine(&self) -> &FailoverEngine {
        &self.engine
    }

    /// Drive the engine until final shutdown. Dropping every
    /// [`NodeHandle`] starts a shutdown.
    pub async fn run(mut self) -> FailoverResult<()> {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        info!(node = %self.engine.node_name(), "Failover node running");

        while !self.engine.is_finished() {
            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.apply(command),
                    None => {
                        warn!("All node handles dropped, shutting down");
                        commands_open = false;
                        self.engine.request_shutdown();
                    }
                },
                Some(exit) = self.exits.recv() => self.engine.child_exited(exit),
                _ = ticker.tick() => self.engine.tick(),
            }
        }

        info!(node = %self.engine.node_name(), "Failover node stopped");
        Ok(())
    }

    fn apply(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Message(envelope) => self.engine.handle_message(envelope),
            NodeCommand::LinksUp { up_peers } => self.engine.links_up(&up_peers),
            NodeCommand::NodeDead(name) => self.engine.node_dead(&name),
            NodeCommand::Standby(scope) => {
                if let Err(e) = self.engine.request_standby(scope) {
                    error!(error = %e, "Standby request failed");
                }
            }
            NodeCommand::Status(reply) => {
                let report = StatusReport::from_engine(&self.engine, Utc::now());
                if reply.send(report).is_err() {
                    debug!("Status requester went away");
                }
            }
            NodeCommand::Shutdown => self.engine.request_shutdown(),
        }
    }
}
