//! Standby negotiation state
//!
//! A three-step hand-off of a resource subset between the two negotiating
//! nodes. The requester announces `me`, the peer acknowledges with `other`,
//! the requester releases and reports `done`, the peer acquires and reports
//! `done`. The scope is always expressed relative to the requester.
//!
//! [`StandbyNegotiation::on_message`] decides the transition and returns the
//! side effect for the engine to carry out.

use std::time::Duration;

use serde::Serialize;

use crate::abstractions::Instant;
use crate::message::StandbyStep;
use crate::resource::ResourceClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StandbyPhase {
    Idle,
    RequestedByUs,
    RequestedByPeer,
    Completed,
}

/// Facts the negotiation needs from the rest of the engine
#[derive(Debug, Clone, Copy)]
pub struct NegotiationContext {
    pub now: Instant,
    pub peer_stable: bool,
    pub locally_stable: bool,
    pub request_timeout: Duration,
    pub resource_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandbyAction {
    /// A new `me` arrived while a deadline is still pending
    Duplicate { remaining: Duration },
    /// Entry refused because a side is not stable
    Refused { reason: &'static str },
    /// Negotiation started; the peer is now considered unstable
    Started { by_us: bool, scope: ResourceClass },
    /// Peer agreed; release our share of `scope`
    Release { scope: ResourceClass },
    /// Our release script finished
    Released { scope: ResourceClass },
    /// Requester released; acquire its share of `scope`
    Acquire { scope: ResourceClass },
    /// Acquisition finished; `ours` when we were the acquirer
    Finished { scope: ResourceClass, ours: bool },
    /// Message does not fit the current phase
    Ignored,
    /// Our own acknowledgement echoed back
    Echo,
}

#[derive(Debug, Clone)]
pub struct StandbyNegotiation {
    phase: StandbyPhase,
    scope: ResourceClass,
    deadline: Option<Instant>,
}

impl Default for StandbyNegotiation {
    fn default() -> Self {
        Self {
            phase: StandbyPhase::Idle,
            scope: ResourceClass::None,
            deadline: None,
        }
    }
}

impl StandbyNegotiation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> StandbyPhase {
        self.phase
    }

    pub fn scope(&self) -> ResourceClass {
        self.scope
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// No negotiation and no deadline pending
    pub fn is_idle(&self) -> bool {
        self.phase == StandbyPhase::Idle && self.deadline.is_none()
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .filter(|deadline| now < *deadline)
            .map(|deadline| deadline.duration_since(now))
    }

    pub fn reset(&mut self) {
        self.phase = StandbyPhase::Idle;
        self.deadline = None;
    }

    /// Cancel a negotiation whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Skip straight to acquisition, used when the peer has shut down
    pub fn force_acquire(&mut self, scope: ResourceClass, now: Instant, timeout: Duration) {
        self.phase = StandbyPhase::Completed;
        self.scope = scope;
        self.deadline = Some(now + timeout);
    }

    pub fn on_message(
        &mut self,
        step: StandbyStep,
        class: ResourceClass,
        from_me: bool,
        ctx: &NegotiationContext,
    ) -> StandbyAction {
        if step == StandbyStep::Me {
            if let Some(remaining) = self.remaining(ctx.now) {
                return StandbyAction::Duplicate { remaining };
            }
        }

        match self.phase {
            StandbyPhase::Idle => {
                if !ctx.peer_stable {
                    return StandbyAction::Refused {
                        reason: "Other side is in flux",
                    };
                }
                if !ctx.locally_stable {
                    return StandbyAction::Refused {
                        reason: "Local resources in flux",
                    };
                }
                self.scope = class;
                if step != StandbyStep::Me {
                    return StandbyAction::Ignored;
                }
                if from_me {
                    self.phase = StandbyPhase::RequestedByUs;
                    self.deadline = Some(ctx.now + ctx.request_timeout);
                } else {
                    self.phase = StandbyPhase::RequestedByPeer;
                    self.deadline = Some(ctx.now + ctx.resource_timeout);
                }
                StandbyAction::Started {
                    by_us: from_me,
                    scope: class,
                }
            }

            StandbyPhase::RequestedByUs => {
                if !from_me {
                    self.scope = class;
                    self.deadline = Some(ctx.now + ctx.resource_timeout);
                    if step == StandbyStep::Other {
                        StandbyAction::Release { scope: class }
                    } else {
                        StandbyAction::Ignored
                    }
                } else if step == StandbyStep::Done {
                    self.phase = StandbyPhase::Completed;
                    self.deadline = Some(ctx.now + ctx.resource_timeout);
                    StandbyAction::Released { scope: self.scope }
                } else {
                    StandbyAction::Ignored
                }
            }

            StandbyPhase::RequestedByPeer => {
                self.scope = class;
                if step == StandbyStep::Done {
                    self.deadline = Some(ctx.now + ctx.resource_timeout);
                    if from_me {
                        return StandbyAction::Ignored;
                    }
                    self.phase = StandbyPhase::Completed;
                    StandbyAction::Acquire { scope: class }
                } else if from_me && step == StandbyStep::Other {
                    StandbyAction::Echo
                } else {
                    StandbyAction::Ignored
                }
            }

            StandbyPhase::Completed => {
                self.scope = class;
                if step != StandbyStep::Done {
                    return StandbyAction::Ignored;
                }
                self.reset();
                StandbyAction::Finished {
                    scope: class,
                    ours: from_me,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx(now_secs: u64) -> NegotiationContext {
        NegotiationContext {
            now: Instant::from_micros(now_secs * 1_000_000),
            peer_stable: true,
            locally_stable: true,
            request_timeout: Duration::from_secs(10),
            resource_timeout: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_requester_side_walkthrough() {
        let mut standby = StandbyNegotiation::new();
        let c = ctx(0);

        assert_eq!(
            standby.on_message(StandbyStep::Me, ResourceClass::Local, true, &c),
            StandbyAction::Started {
                by_us: true,
                scope: ResourceClass::Local
            }
        );
        assert_eq!(standby.phase(), StandbyPhase::RequestedByUs);
        assert_eq!(standby.remaining(c.now), Some(Duration::from_secs(10)));

        assert_eq!(
            standby.on_message(StandbyStep::Other, ResourceClass::Local, false, &c),
            StandbyAction::Release {
                scope: ResourceClass::Local
            }
        );
        assert_eq!(
            standby.on_message(StandbyStep::Done, ResourceClass::Local, true, &c),
            StandbyAction::Released {
                scope: ResourceClass::Local
            }
        );
        assert_eq!(standby.phase(), StandbyPhase::Completed);
        assert_eq!(
            standby.on_message(StandbyStep::Done, ResourceClass::Local, false, &c),
            StandbyAction::Finished {
                scope: ResourceClass::Local,
                ours: false
            }
        );
        assert!(standby.is_idle());
    }

    #[test]
    fn test_acquirer_side_walkthrough() {
        let mut standby = StandbyNegotiation::new();
        let c = ctx(0);

        assert!(matches!(
            standby.on_message(StandbyStep::Me, ResourceClass::Foreign, false, &c),
            StandbyAction::Started { by_us: false, .. }
        ));
        assert_eq!(standby.phase(), StandbyPhase::RequestedByPeer);
        assert_eq!(
            standby.on_message(StandbyStep::Other, ResourceClass::Foreign, true, &c),
            StandbyAction::Echo
        );
        assert_eq!(
            standby.on_message(StandbyStep::Done, ResourceClass::Foreign, false, &c),
            StandbyAction::Acquire {
                scope: ResourceClass::Foreign
            }
        );
        assert_eq!(
            standby.on_message(StandbyStep::Done, ResourceClass::Foreign, true, &c),
            StandbyAction::Finished {
                scope: ResourceClass::Foreign,
                ours: true
            }
        );
        assert!(standby.is_idle());
    }

    #[test]
    fn test_duplicate_request_keeps_deadline() {
        let mut standby = StandbyNegotiation::new();
        standby.on_message(StandbyStep::Me, ResourceClass::All, true, &ctx(0));
        let deadline = standby.deadline();

        let action = standby.on_message(StandbyStep::Me, ResourceClass::All, true, &ctx(3));
        assert_eq!(
            action,
            StandbyAction::Duplicate {
                remaining: Duration::from_secs(7)
            }
        );
        assert_eq!(standby.deadline(), deadline);
        assert_eq!(standby.phase(), StandbyPhase::RequestedByUs);
    }

    #[test]
    fn test_refused_when_unstable() {
        let mut standby = StandbyNegotiation::new();
        let mut c = ctx(0);
        c.peer_stable = false;
        assert!(matches!(
            standby.on_message(StandbyStep::Me, ResourceClass::All, true, &c),
            StandbyAction::Refused { .. }
        ));

        c.peer_stable = true;
        c.locally_stable = false;
        assert!(matches!(
            standby.on_message(StandbyStep::Me, ResourceClass::All, true, &c),
            StandbyAction::Refused { .. }
        ));
        assert!(standby.is_idle());
    }

    #[test]
    fn test_expiry_resets() {
        let mut standby = StandbyNegotiation::new();
        standby.on_message(StandbyStep::Me, ResourceClass::All, true, &ctx(0));
        assert!(!standby.expire(Instant::from_micros(9_000_000)));
        assert!(standby.expire(Instant::from_micros(10_000_000)));
        assert!(standby.is_idle());
    }

    #[test]
    fn test_out_of_order_step_is_ignored() {
        let mut standby = StandbyNegotiation::new();
        assert_eq!(
            standby.on_message(StandbyStep::Done, ResourceClass::All, false, &ctx(0)),
            StandbyAction::Ignored
        );
        assert!(standby.is_idle());
    }
}
