//! Drives a real node task with child processes and a loopback link

use std::sync::Arc;
use std::time::Duration;

use failover_core::config::FailoverConfig;
use failover_core::engine::OwnershipPhase;
use failover_core::link::ChannelLink;
use failover_core::message::{ClusterMessage, StonithResult};
use failover_core::{Envelope, FailoverNode, NodeHandle, ResourceClass, StatusReport};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn fast_config() -> FailoverConfig {
    let mut config = FailoverConfig::test("alpha", "beta");
    config.timing.local_takeover_delay = Duration::from_millis(50);
    config.timing.final_shutdown_delay = Duration::from_millis(20);
    config.timing.tick_interval = Duration::from_millis(10);
    config
}

/// Loop every broadcast back into the node and keep a copy
fn spawn_loopback(
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    handle: NodeHandle,
) -> mpsc::UnboundedReceiver<Envelope> {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let _ = seen_tx.send(envelope.clone());
            if handle.deliver(envelope).is_err() {
                break;
            }
        }
    });
    seen_rx
}

async fn wait_for(handle: &NodeHandle, pred: impl Fn(&StatusReport) -> bool) -> StatusReport {
    timeout(Duration::from_secs(10), async {
        loop {
            let report = handle.status().await.unwrap();
            if pred(&report) {
                return report;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("node never reached the expected state")
}

#[tokio::test]
async fn test_lone_node_takes_over_and_shuts_down() {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (local_tx, mut local_rx) = mpsc::unbounded_channel();
    let link = Arc::new(ChannelLink::new("alpha", out_tx, local_tx));

    let (node, handle) = FailoverNode::new(fast_config(), link).unwrap();
    let mut seen = spawn_loopback(out_rx, handle.clone());
    let task = tokio::spawn(node.run());

    handle.links_up(Vec::new()).unwrap();
    handle.node_dead("beta").unwrap();

    let report = wait_for(&handle, |r| r.resource_state == "all").await;
    assert_eq!(report.phase, OwnershipPhase::Stable);
    assert_eq!(report.held, ResourceClass::All);
    assert_eq!(report.running_children, 0);

    let dead = local_rx.recv().await.unwrap();
    assert_eq!(dead.from, "beta");

    handle.shutdown().unwrap();
    let result = timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    assert!(result.is_ok());

    let mut messages = Vec::new();
    while let Ok(envelope) = seen.try_recv() {
        messages.push(envelope.message);
    }
    assert!(messages.contains(&ClusterMessage::Starting));
    assert!(messages.contains(&ClusterMessage::Stonith {
        node: "beta".to_string(),
        result: StonithResult::NotConfigured,
    }));
    assert!(messages.contains(&ClusterMessage::ShutdownComplete { ping: false }));
}

#[tokio::test]
async fn test_commands_after_stop_fail() {
    let mut config = fast_config();
    config.manage_resources = false;
    let (out_tx, _out_rx) = mpsc::unbounded_channel();
    let (local_tx, _local_rx) = mpsc::unbounded_channel();
    let link = Arc::new(ChannelLink::new("alpha", out_tx, local_tx));

    let (node, handle) = FailoverNode::new(config, link).unwrap();
    let task = tokio::spawn(node.run());
    handle.shutdown().unwrap();
    timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(handle.shutdown().is_err());
    assert!(handle.status().await.is_err());
}
