//! In-process mesh simulation
//!
//! Peers are routers wired to [`MeshMedium`]s instead of sockets, so tests
//! decide exactly which frames reach which router and in what order.

#![allow(dead_code)]

use bitmesh::dedup::{DedupConfig, DedupStore};
use bitmesh::message::{Destination, MessageEnvelope, MessageKind};
use bitmesh::peer::{LocalIdentity, PeerId, PeerRegistry, PeerUpdate, TransportAddress};
use bitmesh::router::{Router, RouterConfig, RouterEvent};
use bitmesh::transport::{InboundFrame, MemoryTransport, MeshMedium, TransportKind};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const EVENT_CAPACITY: usize = 64;

/// A router with its own registry and dedup store
pub struct SimPeer {
    pub identity: Arc<LocalIdentity>,
    pub registry: Arc<PeerRegistry>,
    pub dedup: Arc<DedupStore>,
    pub router: Arc<Router>,
    events: mpsc::Receiver<RouterEvent>,
}

impl SimPeer {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        let identity = Arc::new(LocalIdentity::generate());
        let registry = Arc::new(PeerRegistry::new());
        let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
        let (tx, events) = mpsc::channel(EVENT_CAPACITY);
        let router = Arc::new(
            Router::new(identity.clone(), config, registry.clone(), dedup.clone())
                .with_events(tx),
        );
        Self {
            identity,
            registry,
            dedup,
            router,
            events,
        }
    }

    pub fn id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Attach to a medium for sending only; inbound frames are fed by hand
    pub fn join(&self, medium: &MeshMedium) -> Arc<MemoryTransport> {
        let transport = medium.attach(self.id());
        self.router.add_transport(transport.clone());
        transport
    }

    /// Record `other` as a direct neighbor on `kind`
    pub fn hear(&self, other: &SimPeer, kind: TransportKind) {
        self.registry.upsert(
            PeerUpdate::seen(other.id(), now_millis())
                .with_address(TransportAddress::new(kind, MeshMedium::address_of(&other.id()))),
        );
    }

    pub fn broadcast(&self, hops: u8) -> MessageEnvelope {
        MessageEnvelope::originate(
            &self.identity,
            Destination::Broadcast,
            MessageKind::Data {
                ack_requested: false,
            },
            Bytes::from_static(b"hello mesh"),
            hops,
        )
    }

    pub fn directed(&self, to: &SimPeer, hops: u8, ack_requested: bool) -> MessageEnvelope {
        MessageEnvelope::originate(
            &self.identity,
            Destination::Peer(to.id()),
            MessageKind::Data { ack_requested },
            Bytes::from_static(b"hello peer"),
            hops,
        )
    }

    /// Events emitted so far, without waiting
    pub fn drain_events(&mut self) -> Vec<RouterEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn deliveries(&mut self) -> usize {
        self.drain_events()
            .iter()
            .filter(|e| matches!(e, RouterEvent::Delivered { .. }))
            .count()
    }
}

/// A frame as `from` would hand it to a neighbor over `via`
pub fn frame_from(envelope: MessageEnvelope, from: &SimPeer, via: TransportKind) -> InboundFrame {
    InboundFrame {
        envelope,
        from: from.id(),
        via,
        address: MeshMedium::address_of(&from.id()),
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
