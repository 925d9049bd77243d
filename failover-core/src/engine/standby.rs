//! Standby hand-off driven by `ask_resources` messages

use tracing::{debug, error, info, warn};

use super::{ChildPurpose, FailoverEngine, OwnershipPhase};
use crate::error::{FailoverError, FailoverResult};
use crate::message::{ClusterMessage, StandbyStep, COMMENT_STANDBY};
use crate::resource::ResourceClass;
use crate::scripts::StandbySide;
use crate::standby::{NegotiationContext, StandbyAction};

impl FailoverEngine {
    /// Ask the peer to take `scope` (relative to us) off our hands
    pub fn request_standby(&mut self, scope: ResourceClass) -> FailoverResult<()> {
        if !self.nice() {
            return Err(FailoverError::invalid_operation(
                "standby",
                "standby requires nice failback",
            ));
        }
        if scope.is_empty() {
            return Err(FailoverError::invalid_operation(
                "standby",
                "empty resource scope",
            ));
        }
        info!(scope = %scope, "Requesting standby");
        self.link.send(&ClusterMessage::AskResources {
            class: scope,
            step: StandbyStep::Me,
        })
    }

    pub(super) fn ask_for_resources(&mut self, from: &str, class: ResourceClass, step: StandbyStep) {
        if !self.nice() {
            info!("Standby mode only implemented when nice failback is on");
            return;
        }
        if self.ownership.phase == OwnershipPhase::ShuttingDown {
            debug!("Standby request ignored during shutdown");
            return;
        }

        let from_me = from == self.config.node_name;
        let ctx = NegotiationContext {
            now: self.clock.now(),
            peer_stable: self.peer.is_stable,
            locally_stable: self.ownership.phase == OwnershipPhase::Stable,
            request_timeout: self.config.timing.standby_request_timeout,
            resource_timeout: self.config.timing.standby_resource_timeout,
        };
        debug!(from, step = step.as_str(), class = %class, "Standby message");

        match self.standby.on_message(step, class, from_me, &ctx) {
            StandbyAction::Duplicate { remaining } => {
                let secs_left = remaining.as_millis().div_ceil(1000);
                warn!(secs_left = secs_left as u64, "Standby in progress - new request ignored");
            }
            StandbyAction::Refused { reason } => {
                warn!(from, "{} - standby request rejected", reason);
            }
            StandbyAction::Started { by_us, scope } => {
                self.peer.is_stable = false;
                if by_us {
                    info!(scope = %scope, "We want to go standby");
                } else {
                    info!(from, scope = %scope, "Peer wants to go standby");
                    self.broadcast(ClusterMessage::AskResources {
                        class: scope,
                        step: StandbyStep::Other,
                    });
                }
            }
            StandbyAction::Release { scope } => self.go_standby(StandbySide::Release, scope),
            StandbyAction::Released { scope } => {
                self.ownership.held = self.ownership.held.without(scope);
                self.audit("standby release");
            }
            StandbyAction::Acquire { scope } => self.go_standby(StandbySide::Acquire, scope),
            StandbyAction::Finished { scope, ours } => {
                if ours {
                    self.ownership.held |= scope.flip();
                    if self.config.auto_failback() {
                        self.flags.local_work_done = true;
                        self.announce_takeover("standby");
                    }
                }
                info!(scope = %scope, "Standby resource acquisition done");
                self.send_resources_held(true, None);
                self.audit("standby finished");
            }
            StandbyAction::Ignored => {
                error!(from, step = step.as_str(), phase = ?self.standby.phase(), "Ignored standby message");
            }
            StandbyAction::Echo => {}
        }

        self.shutdown_if_needed();
    }

    /// Run the release or acquire half of a standby hand-off
    pub(super) fn go_standby(&mut self, side: StandbySide, scope: ResourceClass) {
        if side == StandbySide::Release {
            self.peer.is_stable = false;
            self.ownership.held = self.ownership.held.without(scope);
            self.send_resources_held(false, Some(COMMENT_STANDBY));
        }
        let started = match self.scripts.standby(side, scope) {
            Ok(cmd) => {
                info!(scope = %scope, "{} standby resources", side.describe());
                self.spawn_child(ChildPurpose::Standby { side, scope }, cmd)
                    .is_some()
            }
            Err(e) => {
                error!(scope = %scope, error = %e, "Cannot build standby script");
                false
            }
        };
        if !started {
            // a failed script is reported done as well, so do the same here
            // rather than leave the peer waiting for the deadline
            error!(scope = %scope, "Standby script did not run, reporting step done");
            self.broadcast(ClusterMessage::AskResources {
                class: scope,
                step: StandbyStep::Done,
            });
        }
    }
}
