//! Node death, foreign takeover and fencing

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{ChildPurpose, FailoverEngine, NodeStatus, OwnershipPhase};
use crate::abstractions::{ExitStatus, Instant};
use crate::fencing::FenceOutcome;
use crate::message::{fields, ClusterMessage, Envelope, StonithResult};
use crate::resource::ResourceClass;

/// Status record announcing the death of `name`, stamped like one that came
/// off the wire
fn dead_status(name: &str, ping: bool) -> Envelope {
    Envelope::new(name, ClusterMessage::node_dead(ping))
        .with_field(fields::SEQUENCE, "1")
        .with_field(fields::TIMESTAMP, format!("{:x}", Utc::now().timestamp()))
}

impl FailoverEngine {
    /// A cluster member stopped responding
    pub fn node_dead(&mut self, name: &str) {
        self.recover_dead_node(name);
        self.audit("node death");
    }

    fn recover_dead_node(&mut self, name: &str) {
        let Some(node) = self.nodes.get_mut(name) else {
            warn!(node = name, "Death reported for unknown node");
            return;
        };
        node.status = NodeStatus::Dead;
        let ping = node.ping;
        let any_packets_yet = node.any_packets_yet;
        let has_resources = node.has_resources;
        info!(node = name, ping, "Node is dead");

        self.link.deliver_local(&dead_status(name, ping));

        if !ping && !self.standby.is_idle() {
            info!("Cancelling pending standby operation");
            self.standby.reset();
            if !self.peer.is_stable && self.ownership.held == ResourceClass::All {
                self.peer.is_stable = true;
            }
            self.shutdown_if_needed();
        }

        if !self.manages_resources() {
            return;
        }
        if ping {
            self.takeover_from_node(name);
            return;
        }

        if self.flags.shutdown_in_progress {
            if matches!(
                self.ownership.phase,
                OwnershipPhase::Stable | OwnershipPhase::ShuttingDown
            ) {
                return;
            }
            // never settled, so release whatever was acquired
            self.give_up_resources();
            return;
        }

        self.flags.needs_failback = true;

        let gave_up = if self.nice() {
            self.peer.held == ResourceClass::None
        } else {
            !has_resources
        };
        let need_fence = !(any_packets_yet && gave_up);

        if need_fence {
            if self.fencing.is_configured() {
                self.start_fence(name);
            } else {
                self.send_stonith(name, StonithResult::NotConfigured);
                warn!("No fencing device configured");
                warn!("Shared disks are not protected");
                self.takeover_from_node(name);
            }
            return;
        }

        info!(node = name, "Dead node gave up resources");
        self.send_stonith(name, StonithResult::Unneeded);
        if !self.nice() {
            self.takeover_from_node(name);
            return;
        }
        if self.ownership.held == ResourceClass::All {
            self.peer.is_stable = true;
            return;
        }
        // both halves may be missing when the peer died mid start-up
        if !self.ownership.held.contains(ResourceClass::Local) {
            self.req_our_resources(true);
        }
        if !self.ownership.held.contains(ResourceClass::Foreign) {
            self.takeover_from_node(name);
        }
    }

    /// Take over what `name` owned
    pub(super) fn takeover_from_node(&mut self, name: &str) {
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        let ping = node.ping;

        if self.flags.shutdown_in_progress {
            info!(node = name, "Resource takeover cancelled - shutdown in progress");
            self.shutdown_if_needed();
            return;
        }

        let takeover_of = (!ping).then(|| name.to_string());
        self.queue_notification(dead_status(name, ping), takeover_of);

        if !ping {
            if self.nice() {
                self.ownership.held |= ResourceClass::Foreign;
                self.peer.held = ResourceClass::None;
                self.peer.is_stable = true;
                self.flags.takeover_in_progress = true;
            }
            info!(node = name, "Taking over resources from dead node");
            self.req_our_resources(true);
        }

        if let Some(node) = self.nodes.get_mut(name) {
            node.any_packets_yet = true;
        }
        self.audit("takeover");
    }

    /// Start a reset of `node` unless one is already running
    pub(super) fn start_fence(&mut self, node: &str) {
        if self.fencing.in_flight(node) {
            debug!(node, "Reset already running");
            return;
        }
        let Some(cmd) = self.fencing.begin_reset(node) else {
            return;
        };
        let purpose = ChildPurpose::Fence {
            node: node.to_string(),
        };
        if self.spawn_child(purpose, cmd).is_none() {
            let at = self.fencing.reset_not_started(node, self.clock.now());
            warn!(node, retry_at_us = at.as_micros(), "Reset not started, retry scheduled");
        }
    }

    pub(super) fn on_fence_exit(&mut self, node: &str, status: ExitStatus) {
        let now = self.clock.now();
        match self.fencing.on_reset_exit(node, status, now) {
            FenceOutcome::Fenced => {
                self.send_stonith(node, StonithResult::Ok);
                self.takeover_from_node(node);
            }
            FenceOutcome::RetryScheduled { result, .. } => self.send_stonith(node, result),
        }
        self.audit("fence exit");
    }

    /// Run the periodic fencing device check if due
    pub(super) fn run_due_fence_status(&mut self, now: Instant) {
        let Some(cmd) = self.fencing.due_status_check(now) else {
            return;
        };
        if self.spawn_child(ChildPurpose::FenceStatus, cmd).is_none() {
            self.fencing.on_status_exit(ExitStatus::Exited(-1), now);
        }
    }

    fn send_stonith(&self, node: &str, result: StonithResult) {
        debug!(node, result = result.as_str(), "Reporting fencing result");
        self.broadcast(ClusterMessage::Stonith {
            node: node.to_string(),
            result,
        });
    }
}
