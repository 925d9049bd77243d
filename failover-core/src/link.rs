//! Cluster link seam
//!
//! The engine hands outgoing messages to a [`ClusterLink`] and never deals
//! with transport details. A broadcast reaches every node, the sender
//! included; the engine relies on receiving its own messages back.

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FailoverError, FailoverResult};
use crate::message::{ClusterMessage, Envelope};

pub trait ClusterLink: Send + Sync {
    /// Broadcast `message` to the cluster, ourselves included
    fn send(&self, message: &ClusterMessage) -> FailoverResult<()>;

    /// Hand an event to local observers only (API clients, status tools)
    fn deliver_local(&self, envelope: &Envelope);
}

/// Link backed by tokio channels
///
/// Outgoing broadcasts are stamped with the local node name and pushed to
/// `outbound`; whoever drains it is responsible for looping them back.
pub struct ChannelLink {
    node_name: String,
    outbound: mpsc::UnboundedSender<Envelope>,
    local: mpsc::UnboundedSender<Envelope>,
}

impl ChannelLink {
    pub fn new(
        node_name: impl Into<String>,
        outbound: mpsc::UnboundedSender<Envelope>,
        local: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            outbound,
            local,
        }
    }
}

impl ClusterLink for ChannelLink {
    fn send(&self, message: &ClusterMessage) -> FailoverResult<()> {
        let envelope = Envelope::new(self.node_name.as_str(), message.clone());
        self.outbound
            .send(envelope)
            .map_err(|_| FailoverError::link("outbound channel closed"))
    }

    fn deliver_local(&self, envelope: &Envelope) {
        if self.local.send(envelope.clone()).is_err() {
            debug!(msg_type = envelope.message.type_name(), "No local observers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_link_stamps_origin() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (local_tx, mut local_rx) = mpsc::unbounded_channel();
        let link = ChannelLink::new("alpha", out_tx, local_tx);

        link.send(&ClusterMessage::Starting).unwrap();
        let sent = out_rx.try_recv().unwrap();
        assert_eq!(sent.from, "alpha");
        assert_eq!(sent.message, ClusterMessage::Starting);

        link.deliver_local(&Envelope::new("beta", ClusterMessage::node_dead(false)));
        assert_eq!(local_rx.try_recv().unwrap().from, "beta");
    }

    #[test]
    fn test_send_on_closed_channel_fails() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (local_tx, _local_rx) = mpsc::unbounded_channel();
        drop(out_rx);
        let link = ChannelLink::new("alpha", out_tx, local_tx);
        assert!(link.send(&ClusterMessage::Starting).is_err());
    }
}
