use crate::message::MessageEnvelope;
use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

/// Channel family a transport belongs to.
///
/// Ordering doubles as dispatch preference: local mesh is tried before the
/// relay network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Unreliable, unordered, range-limited local mesh
    LocalMesh,
    /// Higher latency, globally reachable relay network
    Relay,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LocalMesh => "local_mesh",
            TransportKind::Relay => "relay",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link-level target of a single transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDestination {
    /// A single directly reachable peer
    Peer(PeerId),
    /// Every reachable peer on the link except the listed ones
    Broadcast { exclude: Vec<PeerId> },
}

impl LinkDestination {
    pub fn broadcast() -> Self {
        LinkDestination::Broadcast {
            exclude: Vec::new(),
        }
    }

    /// Whether a peer would receive a transmission to this destination
    pub fn includes(&self, peer: &PeerId) -> bool {
        match self {
            LinkDestination::Peer(target) => target == peer,
            LinkDestination::Broadcast { exclude } => !exclude.contains(peer),
        }
    }
}

/// Result of handing a frame to a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    AcceptedForTransmission,
    TransportUnavailable,
    DestinationUnreachable,
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SendOutcome::AcceptedForTransmission)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SendOutcome::AcceptedForTransmission => "accepted",
            SendOutcome::TransportUnavailable => "unavailable",
            SendOutcome::DestinationUnreachable => "unreachable",
        }
    }
}

/// A decoded frame handed to subscribers
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub envelope: MessageEnvelope,
    /// Immediate transmitter, not necessarily the originator
    pub from: PeerId,
    pub via: TransportKind,
    /// Transport-specific address of the transmitter
    pub address: String,
}

pub type InboundSink = mpsc::UnboundedSender<InboundFrame>;

/// Configuration for the UDP local-mesh transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpMeshConfig {
    /// Address to bind the datagram socket on
    pub bind_addr: SocketAddr,

    /// Neighbor sockets to transmit to before any peer has been heard
    pub seeds: Vec<SocketAddr>,
}

impl Default for UdpMeshConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            seeds: Vec::new(),
        }
    }
}

/// Configuration for the QUIC relay transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicRelayConfig {
    pub bind_addr: SocketAddr,

    /// Relay endpoints dialled at startup
    pub relays: Vec<SocketAddr>,

    /// Accept any server certificate (self-signed test relays only)
    pub insecure_skip_verify: bool,

    #[serde(with = "crate::config::duration_ms")]
    pub idle_timeout: Duration,

    #[serde(with = "crate::config::duration_ms")]
    pub keep_alive_interval: Duration,
}

impl Default for QuicRelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            relays: Vec::new(),
            insecure_skip_verify: false,
            idle_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(5),
        }
    }
}
