//! UDP stand-in for the cluster transport
//!
//! Carries message records as JSON datagrams, sends keepalives and declares a
//! peer dead after `dead_time` of silence. Also serves a loopback control
//! socket for operator commands. Membership is deliberately crude: one socket
//! per node, no retransmission, no ordering guarantees beyond what UDP gives.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use failover_core::error::{FailoverError, FailoverResult};
use failover_core::link::ChannelLink;
use failover_core::message::{ClusterMessage, RawMessage, STATUS_ACTIVE};
use failover_core::{Envelope, FailoverConfig, FailoverNode, NodeHandle, ResourceClass, StatusReport};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address cluster datagrams are received on
    pub bind: SocketAddr,

    /// Peer node name to datagram address
    pub peers: BTreeMap<String, SocketAddr>,

    /// Loopback address for operator commands
    pub control: SocketAddr,

    #[serde(with = "humantime_serde")]
    pub keepalive: Duration,

    /// Silence after which a peer is declared dead; also how long start-up
    /// waits to hear from peers before bringing links up
    #[serde(with = "humantime_serde")]
    pub dead_time: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 6940)),
            peers: BTreeMap::new(),
            control: SocketAddr::from(([127, 0, 0, 1], 6941)),
            keepalive: Duration::from_secs(1),
            dead_time: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self, config: &FailoverConfig) -> FailoverResult<()> {
        if self.keepalive.is_zero() || self.dead_time <= self.keepalive {
            return Err(FailoverError::configuration(
                "transport.dead_time",
                "must be longer than a non-zero keepalive",
            ));
        }
        for node in config.nodes.iter().filter(|n| !n.ping) {
            if !self.peers.contains_key(&node.name) {
                return Err(FailoverError::configuration(
                    "transport.peers",
                    format!("no address for node '{}'", node.name),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Datagram {
    Keepalive { from: String },
    Message { record: RawMessage },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    Standby { scope: ResourceClass },
    Status,
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlReply {
    Accepted,
    Status { report: StatusReport },
    Error { message: String },
}

/// Send one control request and wait for the raw JSON reply
pub async fn control_request(
    control: SocketAddr,
    request: &ControlRequest,
    wait: Duration,
) -> FailoverResult<serde_json::Value> {
    let socket = UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    socket.send_to(&serde_json::to_vec(request)?, control).await?;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (len, _) = time::timeout(wait, socket.recv_from(&mut buf))
        .await
        .map_err(|_| FailoverError::link(format!("no reply from {}", control)))??;
    Ok(serde_json::from_slice(&buf[..len])?)
}

struct PeerLiveness {
    last_seen: Option<Instant>,
    dead: bool,
}

pub struct UdpTransport {
    config: FailoverConfig,
    transport: TransportConfig,
}

impl UdpTransport {
    pub fn new(config: FailoverConfig, transport: TransportConfig) -> FailoverResult<Self> {
        config.validate()?;
        transport.validate(&config)?;
        Ok(Self { config, transport })
    }

    /// Run the node and its transport until final shutdown or ctrl-c driven
    /// shutdown completes
    pub async fn run(self) -> FailoverResult<()> {
        let node_name = self.config.node_name.clone();
        let socket = Arc::new(UdpSocket::bind(self.transport.bind).await?);
        let control = UdpSocket::bind(self.transport.control).await?;
        info!(node = %node_name, bind = %self.transport.bind, control = %self.transport.control, "Transport listening");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
        let (local_tx, mut local_rx) = mpsc::unbounded_channel::<Envelope>();
        let link = Arc::new(ChannelLink::new(node_name.as_str(), out_tx, local_tx));
        let (node, handle) = FailoverNode::new(self.config.clone(), link)?;
        let mut node_task = tokio::spawn(node.run());

        let peers = self.transport.peers.clone();
        let mut liveness: HashMap<String, PeerLiveness> = peers
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    PeerLiveness {
                        last_seen: None,
                        dead: false,
                    },
                )
            })
            .collect();

        let started = Instant::now();
        let mut links_up = false;
        let mut keepalive = time::interval(self.transport.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut control_buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                joined = &mut node_task => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) => Err(FailoverError::DriverStopped { reason: e.to_string() }),
                    };
                }
                Some(envelope) = out_rx.recv() => {
                    let datagram = Datagram::Message { record: envelope.to_record() };
                    broadcast(&socket, &peers, &datagram).await;
                    if let Err(e) = handle.deliver(envelope) {
                        debug!(error = %e, "Loopback after node stopped");
                    }
                }
                Some(envelope) = local_rx.recv() => {
                    info!(from = %envelope.from, msg_type = envelope.message.type_name(), "Local cluster event");
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => {
                            self.on_datagram(&buf[..len], addr, &mut liveness, links_up, &handle);
                        }
                        Err(e) => warn!(error = %e, "Cluster socket receive failed"),
                    }
                }
                received = control.recv_from(&mut control_buf) => {
                    match received {
                        Ok((len, addr)) => {
                            let reply = on_control(&control_buf[..len], &handle).await;
                            match serde_json::to_vec(&reply) {
                                Ok(bytes) => {
                                    if let Err(e) = control.send_to(&bytes, addr).await {
                                        warn!(%addr, error = %e, "Cannot answer control request");
                                    }
                                }
                                Err(e) => error!(error = %e, "Cannot encode control reply"),
                            }
                        }
                        Err(e) => warn!(error = %e, "Control socket receive failed"),
                    }
                }
                _ = keepalive.tick() => {
                    let datagram = Datagram::Keepalive { from: node_name.clone() };
                    broadcast(&socket, &peers, &datagram).await;

                    let now = Instant::now();
                    if !links_up && (now.duration_since(started) >= self.transport.dead_time
                        || liveness.values().all(|p| p.last_seen.is_some()))
                    {
                        links_up = true;
                        let up: Vec<String> = liveness
                            .iter()
                            .filter(|(_, p)| p.last_seen.is_some())
                            .map(|(name, _)| name.clone())
                            .collect();
                        info!(up = ?up, "Cluster links up");
                        handle.links_up(up)?;
                    }
                    if links_up {
                        for (name, peer) in liveness.iter_mut() {
                            let silent = peer
                                .last_seen
                                .map(|seen| now.duration_since(seen))
                                .unwrap_or_else(|| now.duration_since(started));
                            if !peer.dead && silent >= self.transport.dead_time {
                                peer.dead = true;
                                warn!(node = %name, silent_ms = silent.as_millis() as u64, "Node declared dead");
                                handle.node_dead(name.as_str())?;
                            }
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    handle.shutdown()?;
                }
            }
        }
    }

    fn on_datagram(
        &self,
        bytes: &[u8],
        addr: SocketAddr,
        liveness: &mut HashMap<String, PeerLiveness>,
        links_up: bool,
        handle: &NodeHandle,
    ) {
        let datagram: Datagram = match serde_json::from_slice(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!(%addr, error = %e, "Dropping undecodable datagram");
                return;
            }
        };
        let (from, envelope) = match datagram {
            Datagram::Keepalive { from } => (from, None),
            Datagram::Message { record } => match Envelope::decode(record) {
                Ok(envelope) => (envelope.from.clone(), Some(envelope)),
                Err(e) => {
                    error!(%addr, error = %e, "Dropping malformed cluster message");
                    return;
                }
            },
        };
        let Some(peer) = liveness.get_mut(&from) else {
            warn!(%addr, node = %from, "Datagram from unknown node");
            return;
        };

        let first_contact = peer.last_seen.is_none() || peer.dead;
        peer.last_seen = Some(Instant::now());
        if first_contact && links_up {
            peer.dead = false;
            info!(node = %from, "Node is active");
            let status = Envelope::new(
                from.as_str(),
                ClusterMessage::Status {
                    status: STATUS_ACTIVE.to_string(),
                    ping: false,
                },
            );
            if let Err(e) = handle.deliver(status) {
                debug!(error = %e, "Node stopped");
            }
        }
        if let Some(envelope) = envelope {
            if let Err(e) = handle.deliver(envelope) {
                debug!(error = %e, "Node stopped");
            }
        }
    }
}

async fn broadcast(socket: &UdpSocket, peers: &BTreeMap<String, SocketAddr>, datagram: &Datagram) {
    let bytes = match serde_json::to_vec(datagram) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Cannot encode datagram");
            return;
        }
    };
    let mut failed = BTreeSet::new();
    for (name, addr) in peers {
        if socket.send_to(&bytes, addr).await.is_err() {
            failed.insert(name.as_str());
        }
    }
    if !failed.is_empty() {
        debug!(failed = ?failed, "Datagram not sent to some peers");
    }
}

async fn on_control(bytes: &[u8], handle: &NodeHandle) -> ControlReply {
    let request: ControlRequest = match serde_json::from_slice(bytes) {
        Ok(request) => request,
        Err(e) => {
            return ControlReply::Error {
                message: format!("bad request: {}", e),
            }
        }
    };
    debug!(request = ?request, "Control request");
    let result = match request {
        ControlRequest::Standby { scope } => handle.request_standby(scope).map(|_| ControlReply::Accepted),
        ControlRequest::Shutdown => handle.shutdown().map(|_| ControlReply::Accepted),
        ControlRequest::Status => handle
            .status()
            .await
            .map(|report| ControlReply::Status { report }),
    };
    result.unwrap_or_else(|e| ControlReply::Error {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_datagram_wire_shape() {
        let record = Envelope::new("alpha", ClusterMessage::Starting).to_record();
        let json = serde_json::to_value(Datagram::Message { record }).unwrap();
        assert_eq!(json["kind"], "message");
        assert_eq!(json["record"]["t"], "starting");
        assert_eq!(json["record"]["src"], "alpha");

        let keepalive: Datagram =
            serde_json::from_str(r#"{"kind":"keepalive","from":"beta"}"#).unwrap();
        assert!(matches!(keepalive, Datagram::Keepalive { from } if from == "beta"));
    }

    #[test]
    fn test_control_request_parsing() {
        let request: ControlRequest =
            serde_json::from_str(r#"{"command":"standby","scope":"foreign"}"#).unwrap();
        assert!(matches!(
            request,
            ControlRequest::Standby {
                scope: ResourceClass::Foreign
            }
        ));
    }

    #[test]
    fn test_transport_needs_every_peer_address() {
        let config = FailoverConfig::test("alpha", "beta");
        let mut transport = TransportConfig::default();
        assert!(transport.validate(&config).is_err());

        transport
            .peers
            .insert("beta".to_string(), SocketAddr::from(([10, 0, 0, 2], 6940)));
        assert!(transport.validate(&config).is_ok());

        transport.dead_time = transport.keepalive;
        assert!(transport.validate(&config).is_err());
    }
}
