//! Resource ownership engine
//!
//! One [`FailoverEngine`] per node holds every piece of failover state: our
//! holdings and lifecycle phase, the view of the peer, the standby
//! negotiation, running children, queued notifications and fencing.
//!
//! The engine is a single-writer context. All mutation happens through
//! `&mut self` from one event loop (see [`crate::node`]); there is no locking
//! because there is no second writer. It never waits on a child: work is
//! spawned and the loop re-enters through [`FailoverEngine::child_exited`].
//!
//! ```text
//!   links_up ──► Starting ──► BothStarting ──┐
//!                   │                        ▼
//!                   └──────────────► ReceivedPeerReport ──► Stable
//!                                                             │
//!                        request_shutdown (once quiescent) ──►  ShuttingDown
//! ```

mod node_death;
mod resources;
mod shutdown;
mod standby;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::abstractions::{ChildExit, Clock, CommandSpec, Instant, ProcessHandle, ProcessSpawner};
use crate::audit;
use crate::config::FailoverConfig;
use crate::deferred_queue::{DeferredQueue, DeferredRequest, NotificationFilter};
use crate::error::FailoverResult;
use crate::fencing::FencingOrchestrator;
use crate::link::ClusterLink;
use crate::message::{types, ClusterMessage, Envelope};
use crate::process_tracker::ProcessTracker;
use crate::resource::ResourceClass;
use crate::scripts::{ScriptCommands, StandbySide};
use crate::standby::StandbyNegotiation;

/// Lifecycle phase of our resource ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OwnershipPhase {
    /// Links not up yet
    Init,
    /// Links up, starting message sent
    Starting,
    /// Starting message sent and received
    BothStarting,
    /// First resource report received
    ReceivedPeerReport,
    /// Local resources settled
    Stable,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OwnershipState {
    pub held: ResourceClass,
    pub phase: OwnershipPhase,
}

/// What we believe the peer holds, in the peer's own frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerView {
    pub held: ResourceClass,
    pub is_stable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
    Init,
    Active,
    Dead,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Init => "init",
            NodeStatus::Active => "active",
            NodeStatus::Dead => "dead",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "active" | "up" => NodeStatus::Active,
            "dead" => NodeStatus::Dead,
            _ => NodeStatus::Init,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeState {
    pub ping: bool,
    pub has_resources: bool,
    /// Heard from at least once
    pub any_packets_yet: bool,
    pub status: NodeStatus,
}

/// Why a child was started, used to dispatch its exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildPurpose {
    AcquireLocal { asked_peer: bool },
    Standby { side: StandbySide, scope: ResourceClass },
    GiveUpAll,
    Notify {
        msg_type: String,
        takeover_of: Option<String>,
    },
    Fence { node: String },
    FenceStatus,
}

impl ChildPurpose {
    /// Resource-management children gate quiescence and the deferred queue
    pub fn is_management(&self) -> bool {
        !matches!(self, ChildPurpose::Fence { .. } | ChildPurpose::FenceStatus)
    }
}

impl fmt::Display for ChildPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildPurpose::AcquireLocal { asked_peer: false } => write!(f, "acquire_local"),
            ChildPurpose::AcquireLocal { asked_peer: true } => write!(f, "acquire_local(ask)"),
            ChildPurpose::Standby { side, scope } => {
                write!(f, "standby({} {})", side.describe(), scope)
            }
            ChildPurpose::GiveUpAll => write!(f, "give_up_all"),
            ChildPurpose::Notify { msg_type, .. } => write!(f, "notify({})", msg_type),
            ChildPurpose::Fence { node } => write!(f, "fence {}", node),
            ChildPurpose::FenceStatus => write!(f, "fence-status"),
        }
    }
}

#[derive(Debug, Default)]
struct Timers {
    local_takeover_at: Option<Instant>,
    failback_retry_at: Option<Instant>,
    final_shutdown_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Flags {
    links_up: bool,
    resources_requested_yet: bool,
    shutdown_in_progress: bool,
    needs_shutdown: bool,
    resource_shutdown_started: bool,
    takeover_in_progress: bool,
    needs_failback: bool,
    local_work_done: bool,
    foreign_work_done: bool,
    takeover_announced: bool,
}

pub struct FailoverEngine {
    config: FailoverConfig,
    clock: Arc<dyn Clock>,
    link: Arc<dyn ClusterLink>,
    spawner: Arc<dyn ProcessSpawner>,
    scripts: ScriptCommands,
    ownership: OwnershipState,
    peer: PeerView,
    nodes: BTreeMap<String, NodeState>,
    local_status: NodeStatus,
    standby: StandbyNegotiation,
    tracker: ProcessTracker<ChildPurpose>,
    deferred: DeferredQueue,
    fencing: FencingOrchestrator,
    timers: Timers,
    flags: Flags,
    finished: bool,
}

impl FailoverEngine {
    pub fn new(
        config: FailoverConfig,
        clock: Arc<dyn Clock>,
        link: Arc<dyn ClusterLink>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> FailoverResult<Self> {
        config.validate()?;

        let scripts = ScriptCommands::new(
            config.scripts.clone(),
            config.node_name.clone(),
            config.nice_failback(),
        );
        let filter = NotificationFilter::from_dir(&config.scripts.notify_dir);
        let fencing = FencingOrchestrator::new(
            config.fencing.clone(),
            config.timing.fence_retry_delay,
            config.timing.fence_status_interval,
        );
        let nodes = config
            .nodes
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    NodeState {
                        ping: n.ping,
                        has_resources: n.has_resources,
                        any_packets_yet: false,
                        status: NodeStatus::Init,
                    },
                )
            })
            .collect();

        info!(
            node = %config.node_name,
            nice_failback = config.nice_failback(),
            auto_failback = config.auto_failback(),
            fencing = config.fencing.is_some(),
            "Failover engine created"
        );

        Ok(Self {
            scripts,
            ownership: OwnershipState {
                held: ResourceClass::None,
                phase: OwnershipPhase::Init,
            },
            peer: PeerView {
                held: ResourceClass::None,
                is_stable: false,
            },
            nodes,
            local_status: NodeStatus::Init,
            standby: StandbyNegotiation::new(),
            tracker: ProcessTracker::new(),
            deferred: DeferredQueue::new(filter),
            fencing,
            timers: Timers::default(),
            flags: Flags::default(),
            finished: false,
            config,
            clock,
            link,
            spawner,
        })
    }

    /// Replace the notification filter read from the notification directory
    pub fn with_notification_filter(mut self, filter: NotificationFilter) -> Self {
        self.deferred = DeferredQueue::new(filter);
        self
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub fn ownership(&self) -> OwnershipState {
        self.ownership
    }

    pub fn held(&self) -> ResourceClass {
        self.ownership.held
    }

    pub fn phase(&self) -> OwnershipPhase {
        self.ownership.phase
    }

    pub fn peer_view(&self) -> PeerView {
        self.peer
    }

    pub fn standby(&self) -> &StandbyNegotiation {
        &self.standby
    }

    pub fn node(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    pub fn fencing(&self) -> &FencingOrchestrator {
        &self.fencing
    }

    pub fn active_management_children(&self) -> usize {
        self.tracker.active_management_count()
    }

    pub fn running_children(&self) -> usize {
        self.tracker.len()
    }

    pub fn pending_notifications(&self) -> usize {
        self.deferred.len()
    }

    pub fn takeover_in_progress(&self) -> bool {
        self.flags.takeover_in_progress
    }

    pub fn shutdown_in_progress(&self) -> bool {
        self.flags.shutdown_in_progress
    }

    /// Final shutdown reached; the driver should exit
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn nice(&self) -> bool {
        self.config.nice_failback()
    }

    fn manages_resources(&self) -> bool {
        self.config.manage_resources
    }

    /// No resource work running or pending
    pub fn is_stable(&self) -> bool {
        let children = self.tracker.active_management_count();
        if !self.nice() {
            debug!(children, "Stability check (legacy)");
            return children == 0;
        }
        debug!(
            children,
            peer_stable = self.peer.is_stable,
            takeover = self.flags.takeover_in_progress,
            standby = ?self.standby.phase(),
            phase = ?self.ownership.phase,
            "Stability check"
        );
        if self.flags.shutdown_in_progress && self.ownership.phase == OwnershipPhase::Init {
            return true;
        }
        self.peer.is_stable
            && !self.flags.takeover_in_progress
            && self.standby.is_idle()
            && children == 0
            && matches!(
                self.ownership.phase,
                OwnershipPhase::Stable | OwnershipPhase::ShuttingDown | OwnershipPhase::Init
            )
    }

    /// Held class when stable, otherwise `transition`
    pub fn resource_state(&self) -> &'static str {
        if self.is_stable() {
            self.ownership.held.as_str()
        } else {
            "transition"
        }
    }

    /// Entry point for every message arriving from the cluster, our own
    /// broadcasts included
    pub fn handle_message(&mut self, envelope: Envelope) {
        let now = self.clock.now();
        self.check_standby_deadline(now);

        let from_self = envelope.is_from(&self.config.node_name);
        if !from_self {
            if let Some(node) = self.nodes.get_mut(&envelope.from) {
                node.any_packets_yet = true;
            }
        }
        debug!(from = %envelope.from, msg_type = envelope.message.type_name(), "Cluster message");

        match &envelope.message {
            ClusterMessage::Starting | ClusterMessage::Resources { .. } => {
                self.process_resource_event(&envelope)
            }
            ClusterMessage::AskResources { class, step } => {
                let (class, step) = (*class, *step);
                self.ask_for_resources(&envelope.from, class, step)
            }
            ClusterMessage::AskRelease(_) => {
                if !from_self {
                    self.queue_notification(envelope, None);
                }
            }
            ClusterMessage::AckRelease(_) => {
                if !self.flags.shutdown_in_progress {
                    self.queue_notification(envelope, None);
                }
            }
            ClusterMessage::ShutdownComplete { .. } => self.on_shutdown_complete(&envelope),
            ClusterMessage::Status { status, .. } => {
                let status = NodeStatus::parse(status);
                if from_self {
                    self.local_status = status;
                } else if let Some(node) = self.nodes.get_mut(&envelope.from) {
                    node.status = status;
                }
                self.queue_notification(envelope, None);
            }
            ClusterMessage::Stonith { .. } | ClusterMessage::Other(_) => {
                self.queue_notification(envelope, None)
            }
        }
    }

    /// Dispatch a child's exit
    pub fn child_exited(&mut self, exit: ChildExit) {
        let Some(process) = self.tracker.complete(exit.handle) else {
            return;
        };
        let now = self.clock.now();
        debug!(
            purpose = %process.purpose,
            pid = process.pid,
            status = %exit.status,
            elapsed_ms = now.duration_since(process.started_at).as_millis() as u64,
            "Child exited"
        );
        if process.managed && !exit.status.success() {
            error!(purpose = %process.purpose, status = %exit.status, "Resource child failed");
        }

        match process.purpose {
            ChildPurpose::AcquireLocal { .. } => {
                info!("Local resource acquisition completed");
                self.flags.local_work_done = true;
                self.announce_takeover("acquire_local");
                self.send_resources_held(true, Some(crate::message::COMMENT_REQ_OUR_RESOURCES));
            }
            ChildPurpose::Standby { side, scope } => {
                info!(scope = %scope, "{} of standby resources completed", side.describe());
                self.broadcast(ClusterMessage::AskResources {
                    class: scope,
                    step: crate::message::StandbyStep::Done,
                });
            }
            ChildPurpose::GiveUpAll => {
                info!("All HA resources relinquished");
                self.broadcast(ClusterMessage::ShutdownComplete { ping: false });
            }
            ChildPurpose::Notify {
                msg_type,
                takeover_of,
            } => {
                if msg_type == types::ACK_RELEASE {
                    self.flags.local_work_done = true;
                    self.announce_takeover(types::ACK_RELEASE);
                } else if !self.nice() && msg_type == types::STATUS && self.dead_peer_count() > 0 {
                    self.flags.foreign_work_done = true;
                    self.announce_takeover(types::STATUS);
                }
                if let Some(node) = takeover_of {
                    self.finish_takeover_notification(&node);
                }
            }
            ChildPurpose::Fence { node } => self.on_fence_exit(&node, exit.status),
            ChildPurpose::FenceStatus => self.fencing.on_status_exit(exit.status, now),
        }

        if process.managed {
            self.start_next_deferred();
            self.shutdown_if_needed();
        }
    }

    /// Fire every timer that is due
    pub fn tick(&mut self) {
        let now = self.clock.now();
        self.check_standby_deadline(now);

        if self.nice()
            && self.ownership.phase == OwnershipPhase::ReceivedPeerReport
            && self.timers.local_takeover_at.is_some_and(|at| now >= at)
        {
            self.take_local_after_timeout();
        }

        if self.timers.failback_retry_at.is_some_and(|at| now >= at) {
            self.timers.failback_retry_at = None;
            self.perform_auto_failback();
        }

        for node in self.fencing.due_retries(now) {
            self.start_fence(&node);
        }
        self.run_due_fence_status(now);

        if !self.finished && self.timers.final_shutdown_at.is_some_and(|at| now >= at) {
            info!(node = %self.config.node_name, "Final shutdown");
            self.finished = true;
        }

        self.shutdown_if_needed();
    }

    fn check_standby_deadline(&mut self, now: Instant) {
        if self.standby.expire(now) {
            self.peer.is_stable = true;
            warn!("No reply to standby request. Standby request cancelled.");
        }
    }

    fn set_phase(&mut self, phase: OwnershipPhase) {
        if self.ownership.phase != phase {
            info!(from = ?self.ownership.phase, to = ?phase, "Resource phase transition");
            self.ownership.phase = phase;
        }
    }

    fn audit(&self, after: &str) {
        if !self.nice() || !self.manages_resources() {
            return;
        }
        let quiescent = self.is_stable()
            && !self.flags.shutdown_in_progress
            && self.ownership.phase != OwnershipPhase::ShuttingDown;
        debug!(after, held = %self.ownership.held, peer_held = %self.peer.held, quiescent, "Ownership audit");
        audit::audit(self.ownership.held, self.peer.held, quiescent);
    }

    fn announce_takeover(&mut self, reason: &str) {
        debug!(
            local = self.flags.local_work_done,
            foreign = self.flags.foreign_work_done,
            reason,
            "Takeover progress"
        );
        if self.flags.takeover_announced
            || !self.flags.local_work_done
            || !self.flags.foreign_work_done
        {
            return;
        }
        info!(reason, "Initial resource acquisition complete");
        self.flags.takeover_announced = true;
    }

    fn broadcast(&self, message: ClusterMessage) {
        if let Err(e) = self.link.send(&message) {
            error!(msg_type = message.type_name(), error = %e, "Cannot send cluster message");
        }
    }

    fn dead_peer_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| !n.ping && n.status == NodeStatus::Dead)
            .count()
    }

    fn active_peer_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| !n.ping && n.status == NodeStatus::Active)
            .count()
    }

    fn spawn_child(&mut self, purpose: ChildPurpose, cmd: CommandSpec) -> Option<ProcessHandle> {
        let managed = purpose.is_management();
        let now = self.clock.now();
        self.tracker
            .spawn(self.spawner.as_ref(), &cmd, purpose, managed, now)
            .ok()
    }

    /// Queue a notification; `takeover_of` marks the dead-node notification
    /// whose completion finishes a takeover
    fn queue_notification(&mut self, envelope: Envelope, takeover_of: Option<String>) {
        if !self.manages_resources() {
            return;
        }
        let request = DeferredRequest {
            envelope,
            held_before: self.ownership.held,
            takeover_of,
            queued_at: self.clock.now(),
        };
        let takeover_of = request.takeover_of.clone();
        if self.deferred.enqueue(request) {
            self.start_next_deferred();
        } else if let Some(node) = takeover_of {
            self.finish_takeover_notification(&node);
        }
    }

    /// Start queued notifications while no management child is running
    fn start_next_deferred(&mut self) {
        while let Some(request) = self
            .deferred
            .next_ready(self.tracker.active_management_count())
        {
            let msg_type = request.envelope.message.type_name().to_string();
            let cmd = self.scripts.notify(
                &request.envelope,
                self.local_status.as_str(),
                request.held_before,
            );
            debug!(msg_type = %msg_type, waited_ms = self.clock.now().duration_since(request.queued_at).as_millis() as u64, "Running deferred notification");
            let purpose = ChildPurpose::Notify {
                msg_type,
                takeover_of: request.takeover_of.clone(),
            };
            if self.spawn_child(purpose, cmd).is_some() {
                return;
            }
            if let Some(node) = request.takeover_of {
                self.finish_takeover_notification(&node);
            }
        }
    }

    /// The dead-node notification has run (or could not run); report the
    /// foreign takeover as done
    fn finish_takeover_notification(&mut self, node: &str) {
        if !self.nice() || self.flags.shutdown_in_progress {
            return;
        }
        debug!(node, "Foreign takeover finished");
        self.broadcast(ClusterMessage::Resources {
            class: ResourceClass::Foreign,
            kind: crate::resource::ReportKind::Incremental,
            stable: None,
            comment: Some(crate::message::COMMENT_MACH_DOWN.to_string()),
        });
    }
}
