//! Ownership audit
//!
//! Read-only checks over both sides' holdings. Violations are reported, never
//! corrected. `held` is our view, `peer_held` is the peer's report in its own
//! frame, so our `Local` groups are its `Foreign` ones.

use std::fmt;

use tracing::error;

use crate::resource::ResourceClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditViolation {
    BothOwnLocal,
    BothOwnForeign,
    NoOneOwnsLocal,
    NoOneOwnsForeign,
}

impl fmt::Display for AuditViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuditViolation::BothOwnLocal => "Both machines own our resources!",
            AuditViolation::BothOwnForeign => "Both machines own foreign resources!",
            AuditViolation::NoOneOwnsLocal => "No one owns our local resources!",
            AuditViolation::NoOneOwnsForeign => "No one owns foreign resources!",
        };
        f.write_str(text)
    }
}

/// Check holdings. Orphan checks only run when `quiescent` is set, that is
/// stable and not shutting down.
pub fn check(held: ResourceClass, peer_held: ResourceClass, quiescent: bool) -> Vec<AuditViolation> {
    let mut violations = Vec::new();
    let we_local = held.intersects(ResourceClass::Local);
    let we_foreign = held.intersects(ResourceClass::Foreign);
    let they_local = peer_held.intersects(ResourceClass::Local);
    let they_foreign = peer_held.intersects(ResourceClass::Foreign);

    if we_local && they_foreign {
        violations.push(AuditViolation::BothOwnLocal);
    }
    if they_local && we_foreign {
        violations.push(AuditViolation::BothOwnForeign);
    }

    if quiescent {
        if !we_local && !they_foreign {
            violations.push(AuditViolation::NoOneOwnsLocal);
        }
        if !they_local && !we_foreign {
            violations.push(AuditViolation::NoOneOwnsForeign);
        }
    }
    violations
}

/// Run [`check`] and log every violation at error level
pub fn audit(held: ResourceClass, peer_held: ResourceClass, quiescent: bool) -> Vec<AuditViolation> {
    let violations = check(held, peer_held, quiescent);
    for violation in &violations {
        error!(held = %held, peer_held = %peer_held, "{}", violation);
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use ResourceClass::*;

    #[test]
    fn test_clean_split() {
        assert!(check(Local, Local, true).is_empty());
        assert!(check(All, None, true).is_empty());
        assert!(check(None, All, true).is_empty());
    }

    #[test]
    fn test_double_ownership() {
        assert_eq!(check(Local, Foreign, false), vec![AuditViolation::BothOwnLocal]);
        assert_eq!(check(Foreign, Local, false), vec![AuditViolation::BothOwnForeign]);
        assert_eq!(
            check(All, All, false),
            vec![AuditViolation::BothOwnLocal, AuditViolation::BothOwnForeign]
        );
    }

    #[test]
    fn test_orphans_only_when_quiescent() {
        assert!(check(None, None, false).is_empty());
        assert_eq!(
            check(None, None, true),
            vec![AuditViolation::NoOneOwnsLocal, AuditViolation::NoOneOwnsForeign]
        );
        assert_eq!(check(Local, None, true), vec![AuditViolation::NoOneOwnsForeign]);
    }

    #[traced_test]
    #[test]
    fn test_violations_are_logged() {
        let found = audit(Local, Foreign, false);
        assert_eq!(found.len(), 1);
        assert!(logs_contain("Both machines own our resources!"));
    }
}
