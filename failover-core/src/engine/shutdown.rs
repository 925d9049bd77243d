//! Orderly shutdown: release everything, tell the peer, then stop

use tracing::{debug, error, info, warn};

use super::{ChildPurpose, FailoverEngine, OwnershipPhase};
use crate::message::{Envelope, COMMENT_SHUTDOWN};
use crate::resource::ResourceClass;

impl FailoverEngine {
    /// Begin shutdown; delayed until resource activity settles
    pub fn request_shutdown(&mut self) {
        if self.flags.shutdown_in_progress {
            debug!("Shutdown already in progress");
            return;
        }
        info!(node = %self.config.node_name, "Shutdown requested");
        // no new acquisitions or takeovers from here on
        self.flags.shutdown_in_progress = true;
        self.give_up_resources();
    }

    pub(super) fn give_up_resources(&mut self) {
        if !self.manages_resources() {
            self.flags.shutdown_in_progress = true;
            self.arm_final_shutdown();
            return;
        }

        if !self.is_stable() {
            if !self.flags.needs_shutdown {
                warn!("Shutdown delayed until current resource activity finishes");
            }
            self.flags.needs_shutdown = true;
            return;
        }

        self.flags.needs_shutdown = false;
        self.flags.shutdown_in_progress = true;
        if self.flags.resource_shutdown_started {
            info!("Resource shutdown already in progress");
            return;
        }
        self.flags.resource_shutdown_started = true;

        self.ownership.held = ResourceClass::None;
        self.set_phase(OwnershipPhase::ShuttingDown);
        self.send_resources_held(false, Some(COMMENT_SHUTDOWN));

        info!("Giving up all HA resources");
        let cmd = self.scripts.give_up_all();
        if self.spawn_child(ChildPurpose::GiveUpAll, cmd).is_none() {
            // without the release job nothing will report completion
            error!("Cannot give up resources, stopping without releasing them");
            self.arm_final_shutdown();
        }
        self.audit("shutdown");
    }

    fn arm_final_shutdown(&mut self) {
        if self.timers.final_shutdown_at.is_none() {
            let at = self.clock.now() + self.config.timing.final_shutdown_delay;
            debug!(at_us = at.as_micros(), "Final shutdown armed");
            self.timers.final_shutdown_at = Some(at);
        }
    }

    pub(super) fn shutdown_if_needed(&mut self) {
        if self.flags.needs_shutdown {
            self.give_up_resources();
        }
    }

    pub(super) fn on_shutdown_complete(&mut self, envelope: &Envelope) {
        if self.flags.links_up {
            self.process_resource_event(envelope);
        }

        if envelope.is_from(&self.config.node_name) {
            self.arm_final_shutdown();
            return;
        }

        if let Some(node) = self.nodes.get_mut(&envelope.from) {
            node.has_resources = false;
        }
        self.peer.is_stable = false;
        self.peer.held = ResourceClass::None;
        info!(from = %envelope.from, "Received shutdown notice");
        self.takeover_from_node(&envelope.from);
        self.audit("shutdown complete");
    }
}
