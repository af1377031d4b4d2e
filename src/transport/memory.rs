//! In-process simulated medium
//!
//! A [`MeshMedium`] connects any number of [`MemoryTransport`]s. Local-mesh
//! media only carry frames across explicit links; relay media connect every
//! attached node. Each transport keeps a log of what it was asked to send.
//! Frames can be scheduled to vanish in the air with [`MeshMedium::lose_next`].

use crate::message::MessageEnvelope;
use crate::peer::PeerId;
use crate::transport::codec::decode_frame;
use crate::transport::types::{
    InboundFrame, InboundSink, LinkDestination, SendOutcome, TransportKind,
};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Station {
    sinks: Mutex<Vec<InboundSink>>,
    available: AtomicBool,
}

impl Station {
    fn deliver(&self, frame: InboundFrame) {
        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| !sink.is_closed());
        for sink in sinks.iter() {
            let _ = sink.send(frame.clone());
        }
    }
}

type LossFilter = Box<dyn Fn(&MessageEnvelope) -> bool + Send + Sync>;

struct Loss {
    remaining: usize,
    filter: LossFilter,
}

#[derive(Default)]
struct MediumState {
    stations: HashMap<PeerId, Arc<Station>>,
    links: HashSet<(PeerId, PeerId)>,
    losses: Vec<Loss>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared simulated channel
#[derive(Clone)]
pub struct MeshMedium {
    kind: TransportKind,
    fully_connected: bool,
    state: Arc<Mutex<MediumState>>,
}

impl MeshMedium {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            fully_connected: kind == TransportKind::Relay,
            state: Arc::new(Mutex::new(MediumState::default())),
        }
    }

    /// Range-limited medium; nodes only hear linked neighbors
    pub fn local_mesh() -> Self {
        Self::new(TransportKind::LocalMesh)
    }

    /// Globally reachable medium; every attached node hears every other
    pub fn relay() -> Self {
        Self::new(TransportKind::Relay)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Attach a node and return its transport
    pub fn attach(&self, local: PeerId) -> Arc<MemoryTransport> {
        let station = Arc::new(Station {
            sinks: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        });
        self.state.lock().stations.insert(local, station.clone());

        Arc::new(MemoryTransport {
            local,
            medium: self.clone(),
            station,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn link(&self, a: PeerId, b: PeerId) {
        self.state.lock().links.insert(link_key(a, b));
    }

    pub fn unlink(&self, a: PeerId, b: PeerId) {
        self.state.lock().links.remove(&link_key(a, b));
    }

    /// The next `count` transmissions whose envelope matches `filter` reach
    /// nobody. The sender still sees them accepted.
    pub fn lose_next<F>(&self, count: usize, filter: F)
    where
        F: Fn(&MessageEnvelope) -> bool + Send + Sync + 'static,
    {
        self.state.lock().losses.push(Loss {
            remaining: count,
            filter: Box::new(filter),
        });
    }

    /// Consume one scheduled loss matching `envelope`
    fn take_loss(&self, envelope: &MessageEnvelope) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state
            .losses
            .iter()
            .position(|loss| loss.remaining > 0 && (loss.filter)(envelope))
        else {
            return false;
        };
        state.losses[index].remaining -= 1;
        if state.losses[index].remaining == 0 {
            state.losses.remove(index);
        }
        true
    }

    /// Nodes that would hear a transmission from `peer`
    pub fn neighbors(&self, peer: &PeerId) -> Vec<PeerId> {
        let state = self.state.lock();
        let mut ids: Vec<PeerId> = state
            .stations
            .keys()
            .filter(|other| *other != peer)
            .filter(|other| self.fully_connected || state.links.contains(&link_key(*peer, **other)))
            .copied()
            .collect();
        ids.sort();
        ids
    }

    fn station(&self, peer: &PeerId) -> Option<Arc<Station>> {
        self.state.lock().stations.get(peer).cloned()
    }

    pub fn address_of(peer: &PeerId) -> String {
        format!("mem:{}", peer.to_hex())
    }
}

/// What a [`MemoryTransport`] was asked to transmit
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub envelope: MessageEnvelope,
    pub destination: LinkDestination,
    pub outcome: SendOutcome,
    /// Nodes the frame actually reached
    pub recipients: Vec<PeerId>,
}

pub struct MemoryTransport {
    local: PeerId,
    medium: MeshMedium,
    station: Arc<Station>,
    sent: Mutex<Vec<SentRecord>>,
}

impl MemoryTransport {
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn address(&self) -> String {
        MeshMedium::address_of(&self.local)
    }

    /// Switch the simulated radio on or off. An unavailable transport
    /// neither sends nor hears frames.
    pub fn set_available(&self, available: bool) {
        self.station.available.store(available, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.sent.lock().clone()
    }

    /// Frames accepted for transmission
    pub fn accepted(&self) -> Vec<SentRecord> {
        self.sent
            .lock()
            .iter()
            .filter(|r| r.outcome.is_accepted())
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn log(
        &self,
        envelope: MessageEnvelope,
        destination: &LinkDestination,
        outcome: SendOutcome,
        recipients: Vec<PeerId>,
    ) -> SendOutcome {
        self.sent.lock().push(SentRecord {
            envelope,
            destination: destination.clone(),
            outcome,
            recipients,
        });
        outcome
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.medium.kind
    }

    fn is_available(&self) -> bool {
        self.station.available.load(Ordering::Relaxed)
    }

    async fn send(&self, frame: Bytes, destination: &LinkDestination) -> SendOutcome {
        let (transmitter, envelope) = match decode_frame(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Refusing undecodable frame: {}", e);
                return SendOutcome::TransportUnavailable;
            }
        };

        if !self.is_available() {
            return self.log(envelope, destination, SendOutcome::TransportUnavailable, vec![]);
        }

        let neighbors = self.medium.neighbors(&self.local);
        if let LinkDestination::Peer(target) = destination {
            if !neighbors.contains(target) {
                return self.log(
                    envelope,
                    destination,
                    SendOutcome::DestinationUnreachable,
                    vec![],
                );
            }
        }

        if self.medium.take_loss(&envelope) {
            return self.log(
                envelope,
                destination,
                SendOutcome::AcceptedForTransmission,
                vec![],
            );
        }

        let mut recipients = Vec::new();
        for peer in neighbors.into_iter().filter(|p| destination.includes(p)) {
            let Some(station) = self.medium.station(&peer) else {
                continue;
            };
            // Lost in the air if the receiver's radio is off
            if !station.available.load(Ordering::Relaxed) {
                continue;
            }
            station.deliver(InboundFrame {
                envelope: envelope.clone(),
                from: transmitter,
                via: self.medium.kind,
                address: MeshMedium::address_of(&self.local),
            });
            recipients.push(peer);
        }

        self.log(
            envelope,
            destination,
            SendOutcome::AcceptedForTransmission,
            recipients,
        )
    }

    fn subscribe(&self, sink: InboundSink) {
        self.station.sinks.lock().push(sink);
    }
}
