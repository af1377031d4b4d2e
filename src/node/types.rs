use crate::delivery::DeliveryState;
use crate::message::{Destination, Fingerprint, MessageEnvelope};
use crate::peer::PeerId;
use crate::router::RouteOutcome;
use crate::transport::TransportKind;
use bytes::Bytes;
use tokio::sync::watch;

/// Handle returned by [`MeshNode::send`](crate::node::MeshNode::send)
#[derive(Debug)]
pub enum SendReceipt {
    /// Directed message under acknowledgement tracking
    Tracked {
        fingerprint: Fingerprint,
        destination: PeerId,
        state: watch::Receiver<DeliveryState>,
    },

    /// Broadcasts are routed once and never acknowledged
    Broadcast {
        fingerprint: Fingerprint,
        outcome: RouteOutcome,
    },
}

impl SendReceipt {
    pub fn fingerprint(&self) -> Fingerprint {
        match self {
            SendReceipt::Tracked { fingerprint, .. } | SendReceipt::Broadcast { fingerprint, .. } => {
                *fingerprint
            }
        }
    }
}

/// Application payload delivered to this node
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub fingerprint: Fingerprint,
    /// Originator
    pub sender: PeerId,
    /// Neighbor that handed it to us
    pub from: PeerId,
    pub destination: Destination,
    pub payload: Bytes,
    /// Originator's clock, unix milliseconds
    pub created_at: i64,
}

impl ReceivedMessage {
    pub(crate) fn from_envelope(envelope: MessageEnvelope, from: PeerId) -> Self {
        Self {
            fingerprint: envelope.fingerprint,
            sender: envelope.sender,
            from,
            destination: envelope.destination,
            payload: envelope.payload,
            created_at: envelope.created_at,
        }
    }
}

/// What happened while starting a node
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub peer_id: PeerId,
    pub loaded_peers: usize,
    /// Peer table is backed by a working store
    pub persistent: bool,
    pub transports: Vec<TransportKind>,
    /// Configured transports that failed to start
    pub failures: Vec<(TransportKind, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub dedup_purged: usize,
    pub newly_stale: usize,
    pub persisted: bool,
    pub known_peers: usize,
    pub active_deliveries: usize,
}
