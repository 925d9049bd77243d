//! Two engines negotiating over the in-memory medium

use std::time::Duration;

use failover_core::abstractions::ExitStatus;
use failover_core::engine::OwnershipPhase;
use failover_core::test_helpers::TestCluster;
use failover_core::ResourceClass;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

const TAKEOVER_DELAY: Duration = Duration::from_secs(10);

/// Holdings of the two nodes must never overlap. Each node reports in its
/// own frame, so beta's view is mirrored into alpha's before comparing.
fn assert_no_double_ownership(cluster: &TestCluster) {
    let alpha = cluster.engine("alpha").held();
    let beta = cluster.engine("beta").held();
    assert_eq!(
        alpha & beta.flip(),
        ResourceClass::None,
        "alpha holds {}, beta holds {}",
        alpha,
        beta
    );
}

fn started_pair(nice: bool, auto: bool) -> TestCluster {
    let mut cluster = TestCluster::pair(nice, auto);
    cluster.start();
    cluster.settle();
    cluster.advance(TAKEOVER_DELAY);
    cluster.settle();
    cluster
}

#[test]
fn test_simultaneous_start_splits_resources() {
    let mut cluster = TestCluster::pair(true, false);
    cluster.start();
    cluster.settle();

    // both sides reported while starting, so nobody is stable yet
    assert_eq!(cluster.engine("alpha").phase(), OwnershipPhase::ReceivedPeerReport);
    assert_eq!(cluster.engine("beta").phase(), OwnershipPhase::ReceivedPeerReport);

    cluster.advance(TAKEOVER_DELAY);
    cluster.settle();

    for name in ["alpha", "beta"] {
        let engine = cluster.engine(name);
        assert_eq!(engine.phase(), OwnershipPhase::Stable, "{}", name);
        assert_eq!(engine.held(), ResourceClass::Local, "{}", name);
        assert!(engine.is_stable(), "{}", name);
        assert_eq!(engine.peer_view().held, ResourceClass::Local, "{}", name);
    }
    assert_no_double_ownership(&cluster);
}

#[test]
fn test_peer_death_moves_everything_to_survivor() {
    let mut cluster = started_pair(true, false);

    cluster.kill("beta");
    cluster.settle();

    let alpha = cluster.engine("alpha");
    assert_eq!(alpha.held(), ResourceClass::All);
    assert!(!alpha.takeover_in_progress());
    assert!(alpha.is_stable());
}

#[test]
fn test_peer_death_before_anyone_settled_moves_everything_to_survivor() {
    let mut cluster = TestCluster::pair(true, false);
    cluster.start();
    cluster.settle();
    assert_eq!(cluster.engine("alpha").held(), ResourceClass::None);

    cluster.kill("beta");
    cluster.settle();
    cluster.advance(TAKEOVER_DELAY);
    cluster.settle();

    let alpha = cluster.engine("alpha");
    assert_eq!(alpha.held(), ResourceClass::All);
    assert_eq!(alpha.phase(), OwnershipPhase::Stable);
    assert!(alpha.is_stable());
}

#[test]
fn test_rejoining_node_waits_without_auto_failback() {
    let mut cluster = started_pair(true, false);
    cluster.kill("beta");
    cluster.settle();

    cluster.restart("beta");
    cluster.settle();

    assert_eq!(cluster.engine("alpha").held(), ResourceClass::All);
    assert_eq!(cluster.engine("beta").held(), ResourceClass::None);
    assert_eq!(cluster.engine("beta").phase(), OwnershipPhase::Stable);
    assert_no_double_ownership(&cluster);
}

#[test]
fn test_auto_failback_returns_resources() {
    let mut cluster = started_pair(true, true);
    cluster.kill("beta");
    cluster.settle();
    assert_eq!(cluster.engine("alpha").held(), ResourceClass::All);

    cluster.restart("beta");
    cluster.settle();

    assert_eq!(cluster.engine("alpha").held(), ResourceClass::Local);
    assert_eq!(cluster.engine("beta").held(), ResourceClass::Local);
    assert!(cluster.engine("alpha").standby().is_idle());
    assert!(cluster.engine("beta").standby().is_idle());
    assert!(cluster.engine("alpha").is_stable());
    assert!(cluster.engine("beta").is_stable());
    assert_no_double_ownership(&cluster);
}

#[test]
fn test_standby_hands_everything_to_peer() {
    let mut cluster = started_pair(true, false);

    cluster
        .engine_mut("alpha")
        .request_standby(ResourceClass::All)
        .unwrap();
    cluster.settle();

    assert_eq!(cluster.engine("alpha").held(), ResourceClass::None);
    assert_eq!(cluster.engine("beta").held(), ResourceClass::All);
    assert!(cluster.engine("alpha").is_stable());
    assert!(cluster.engine("beta").is_stable());
    assert_no_double_ownership(&cluster);
}

#[test]
fn test_standby_of_local_share_only() {
    let mut cluster = started_pair(true, false);

    cluster
        .engine_mut("beta")
        .request_standby(ResourceClass::Local)
        .unwrap();
    cluster.settle();

    assert_eq!(cluster.engine("alpha").held(), ResourceClass::All);
    assert_eq!(cluster.engine("beta").held(), ResourceClass::None);
    assert_no_double_ownership(&cluster);
}

#[test]
fn test_peer_shutdown_hands_over_and_finishes() {
    let mut cluster = started_pair(true, false);

    cluster.engine_mut("beta").request_shutdown();
    cluster.settle();
    assert_eq!(cluster.engine("beta").phase(), OwnershipPhase::ShuttingDown);
    assert_eq!(cluster.engine("beta").held(), ResourceClass::None);
    assert!(!cluster.engine("beta").is_finished());

    cluster.advance(Duration::from_secs(1));
    assert!(cluster.engine("beta").is_finished());
    assert_eq!(cluster.engine("alpha").held(), ResourceClass::All);
    assert!(cluster.engine("alpha").is_stable());
}

#[test]
fn test_failed_scripts_do_not_block_quiescence() {
    let mut cluster = TestCluster::pair(true, false);
    cluster.start();
    cluster.settle();
    cluster.advance(TAKEOVER_DELAY);
    cluster.deliver();
    cluster.finish_children("alpha", ExitStatus::Exited(1));
    cluster.settle();

    assert!(cluster.engine("alpha").is_stable());
    assert_eq!(cluster.engine("alpha").held(), ResourceClass::Local);
}

#[test]
fn test_legacy_mode_takes_over_unconditionally() {
    let mut cluster = started_pair(false, false);
    assert!(cluster.engine("alpha").is_stable());

    cluster.kill("beta");
    let commands = cluster.node("alpha").started_commands();
    assert!(commands.iter().any(|c| c.contains("takegroup")));
    cluster.settle();
    assert!(cluster.engine("alpha").is_stable());
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Standby(bool, ResourceClass),
    Advance(u64),
}

fn any_step() -> impl Strategy<Value = Step> {
    let scope = prop_oneof![
        Just(ResourceClass::Local),
        Just(ResourceClass::Foreign),
        Just(ResourceClass::All),
    ];
    prop_oneof![
        (any::<bool>(), scope).prop_map(|(alpha, scope)| Step::Standby(alpha, scope)),
        (1u64..20).prop_map(Step::Advance),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_standby_sequences_never_double_own(steps in prop::collection::vec(any_step(), 1..8)) {
        let mut cluster = started_pair(true, false);
        for step in steps {
            match step {
                Step::Standby(alpha, scope) => {
                    let name = if alpha { "alpha" } else { "beta" };
                    cluster.engine_mut(name).request_standby(scope).unwrap();
                }
                Step::Advance(secs) => cluster.advance(Duration::from_secs(secs)),
            }
            cluster.settle();
            let alpha = cluster.engine("alpha").held();
            let beta = cluster.engine("beta").held();
            prop_assert_eq!(alpha & beta.flip(), ResourceClass::None);
        }
    }
}
