//! Resource reports, start-up negotiation and local acquisition

use tracing::{debug, error, info, warn};

use super::{ChildPurpose, FailoverEngine, NodeStatus, OwnershipPhase};
use crate::message::{ClusterMessage, Envelope, StandbyStep, COMMENT_MACH_DOWN, COMMENT_SHUTDOWN};
use crate::resource::{merge, ResourceClass};
use crate::scripts::StandbySide;

impl FailoverEngine {
    /// Cluster links came up. `up_peers` names the peers heard from.
    pub fn links_up(&mut self, up_peers: &[String]) {
        if self.flags.links_up {
            warn!("Cluster links already reported up");
            return;
        }
        self.flags.links_up = true;
        self.local_status = NodeStatus::Active;

        let mut all_up = true;
        for (name, node) in self.nodes.iter_mut() {
            if up_peers.iter().any(|p| p == name) {
                node.status = NodeStatus::Active;
            } else if !node.ping {
                all_up = false;
            }
        }
        info!(up = up_peers.len(), all_up, "Cluster links up");

        if all_up {
            // nobody else's resources to pick up
            self.flags.foreign_work_done = true;
        }

        if self.nice() {
            debug!(phase = ?self.ownership.phase, "Sending starting message");
            self.broadcast(ClusterMessage::Starting);
            self.set_phase(OwnershipPhase::Starting);
        } else if !self.flags.resources_requested_yet {
            self.flags.resources_requested_yet = true;
            self.req_our_resources(false);
        }

        if self.fencing.is_configured() {
            let now = self.clock.now();
            self.fencing.start_status_checks(now);
            self.run_due_fence_status(now);
        }
    }

    /// Apply a `Starting`, `Resources` or `ShutdownComplete` message to the
    /// ownership state
    pub(super) fn process_resource_event(&mut self, envelope: &Envelope) {
        self.shutdown_if_needed();
        if !self.manages_resources() || !self.nice() {
            return;
        }

        let from_self = envelope.is_from(&self.config.node_name);
        let phase = self.ownership.phase;
        let mut new_phase = phase;

        match &envelope.message {
            ClusterMessage::Starting if !from_self => {
                match phase {
                    OwnershipPhase::ReceivedPeerReport
                    | OwnershipPhase::Stable
                    | OwnershipPhase::ShuttingDown => {}
                    OwnershipPhase::Starting => {
                        new_phase = OwnershipPhase::BothStarting;
                        self.flags.foreign_work_done = true;
                        self.announce_takeover("both starting");
                    }
                    OwnershipPhase::Init | OwnershipPhase::BothStarting => {
                        error!(from = %envelope.from, ?phase, "Received starting message in unexpected phase");
                        return;
                    }
                }
                self.peer.is_stable = false;
                debug!("Peer now unstable");
                if self.flags.takeover_in_progress {
                    warn!(from = %envelope.from, "Starting message received during takeover");
                }
                self.send_resources_held(phase == OwnershipPhase::Stable, None);
            }

            ClusterMessage::Resources {
                class,
                kind,
                stable,
                comment,
            } => {
                match phase {
                    OwnershipPhase::Starting | OwnershipPhase::BothStarting => {
                        new_phase = OwnershipPhase::ReceivedPeerReport;
                        if !self.config.auto_failback() {
                            self.flags.foreign_work_done = true;
                            self.announce_takeover("resource report");
                        }
                    }
                    OwnershipPhase::ReceivedPeerReport
                    | OwnershipPhase::Stable
                    | OwnershipPhase::ShuttingDown => {}
                    OwnershipPhase::Init => {
                        error!(from = %envelope.from, ?phase, "Resource message received in unexpected phase");
                        return;
                    }
                }

                if !from_self {
                    self.peer.held = merge(self.peer.held, *class, *kind);
                    match stable {
                        Some(true) if !self.peer.is_stable => {
                            info!(from = %envelope.from, "Remote resource transition completed");
                            self.peer.is_stable = true;
                            self.send_resources_held(phase == OwnershipPhase::Stable, None);
                            self.perform_auto_failback();
                        }
                        Some(false) => {
                            self.peer.is_stable = false;
                            debug!("Peer now unstable");
                        }
                        _ => {}
                    }
                    debug!(peer_held = %self.peer.held, "Peer holdings updated");

                    if !matches!(phase, OwnershipPhase::Stable | OwnershipPhase::ShuttingDown)
                        && self.peer.is_stable
                    {
                        info!("Remote resource transition completed, taking our resources");
                        self.req_our_resources(false);
                        new_phase = OwnershipPhase::Stable;
                        self.send_resources_held(true, None);
                        self.perform_auto_failback();
                        self.flags.foreign_work_done = true;
                        if !self.config.auto_failback()
                            && self.peer.held.intersects(ResourceClass::Foreign)
                        {
                            self.flags.local_work_done = true;
                        }
                        self.announce_takeover("peer report");
                    }
                } else {
                    self.ownership.held = merge(self.ownership.held, *class, *kind);
                    if self.ownership.held.intersects(ResourceClass::Local) {
                        self.flags.local_work_done = true;
                        self.announce_takeover("own report");
                    }
                    match comment.as_deref() {
                        Some(COMMENT_MACH_DOWN) => {
                            info!("Foreign resource takeover complete");
                            self.flags.takeover_in_progress = false;
                            self.ownership.held |= ResourceClass::Foreign;
                            self.flags.needs_failback = true;
                            self.peer.is_stable = true;
                            self.flags.foreign_work_done = true;
                            self.announce_takeover(COMMENT_MACH_DOWN);
                        }
                        Some(COMMENT_SHUTDOWN) => {
                            self.ownership.phase = OwnershipPhase::ShuttingDown;
                            new_phase = OwnershipPhase::ShuttingDown;
                        }
                        _ => {}
                    }
                }
            }

            ClusterMessage::ShutdownComplete { .. } => {
                if !from_self {
                    self.peer.is_stable = true;
                    self.peer.held = ResourceClass::None;
                    debug!("Peer now stable, it has shut down");
                    if self.ownership.held != ResourceClass::All && !self.flags.shutdown_in_progress {
                        // take whatever we are missing right away; the scope
                        // travels in the requester's frame
                        let missing = ResourceClass::All.without(self.ownership.held);
                        let scope = missing.flip();
                        let now = self.clock.now();
                        self.standby.force_acquire(
                            scope,
                            now,
                            self.config.timing.standby_resource_timeout,
                        );
                        self.go_standby(StandbySide::Acquire, scope);
                    }
                } else {
                    self.ownership.phase = OwnershipPhase::ShuttingDown;
                    new_phase = OwnershipPhase::ShuttingDown;
                    self.ownership.held = ResourceClass::None;
                }
            }

            _ => {}
        }

        self.set_phase(new_phase);

        if self.ownership.phase == OwnershipPhase::ReceivedPeerReport
            && self.timers.local_takeover_at.is_none()
        {
            let at = self.clock.now() + self.config.timing.local_takeover_delay;
            self.timers.local_takeover_at = Some(at);
        }

        self.audit("resource event");
        self.shutdown_if_needed();
    }

    /// Nobody became stable in time; take our local resources
    pub(super) fn take_local_after_timeout(&mut self) {
        self.set_phase(OwnershipPhase::Stable);
        self.req_our_resources(false);
        info!("Local resource transition completed");
        self.send_resources_held(true, None);
        self.audit("local takeover");
    }

    /// Start acquiring our own resource groups
    pub(super) fn req_our_resources(&mut self, get_anyway: bool) {
        if !self.manages_resources() || self.flags.shutdown_in_progress {
            return;
        }

        if self.nice() {
            let owned = self.peer.held.intersects(ResourceClass::Foreign)
                || self.ownership.held.intersects(ResourceClass::Local);
            if owned && !get_anyway && self.standby.is_idle() {
                info!("Local resource acquisition completed (none)");
                return;
            }
            // claim before the script runs so an interim report cannot hand
            // the peer our groups
            self.ownership.held |= ResourceClass::Local;
        }

        let asked_peer = self.active_peer_count() > 0;
        let cmd = self.scripts.acquire_local(!asked_peer);
        debug!(asked_peer, command = %cmd.display(), "Acquiring local resources");
        self.spawn_child(ChildPurpose::AcquireLocal { asked_peer }, cmd);
    }

    /// Broadcast a full report of what we hold
    pub(super) fn send_resources_held(&self, stable: bool, comment: Option<&str>) {
        if !self.nice() {
            return;
        }
        debug!(
            held = %self.ownership.held,
            stable,
            comment = comment.unwrap_or("<none>"),
            "Sending resources held"
        );
        self.broadcast(ClusterMessage::resources_held(
            self.ownership.held,
            stable,
            comment,
        ));
    }

    /// Hand foreign resources back once the owner is stable again
    pub(super) fn perform_auto_failback(&mut self) {
        debug!("Checking auto failback");
        if self.flags.shutdown_in_progress
            || !self.ownership.held.intersects(ResourceClass::Foreign)
            || !self.flags.needs_failback
            || !self.config.auto_failback()
        {
            self.flags.needs_failback = false;
            self.shutdown_if_needed();
            return;
        }

        if !self.standby.is_idle() {
            info!("Auto failback skipped, standby negotiation in progress");
            self.flags.needs_failback = false;
            return;
        }

        if !self.peer.is_stable || self.ownership.phase != OwnershipPhase::Stable {
            debug!("Auto failback delayed");
            let at = self.clock.now() + self.config.timing.failback_retry_delay;
            self.timers.failback_retry_at = Some(at);
            return;
        }

        info!("Auto failback triggered");
        self.flags.needs_failback = false;
        self.broadcast(ClusterMessage::AskResources {
            class: ResourceClass::Foreign,
            step: StandbyStep::Me,
        });
    }
}
