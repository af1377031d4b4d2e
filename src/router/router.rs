use crate::dedup::{Admission, DedupStore};
use crate::delivery::Dispatcher;
use crate::message::{Destination, MessageEnvelope, MessageKind};
use crate::metrics::recorder;
use crate::peer::{LocalIdentity, PeerId, PeerRegistry, PeerUpdate, TransportAddress};
use crate::router::rate_limiter::RelayRateLimiter;
use crate::router::types::{
    DropReason, ReceiveOutcome, RouteOutcome, RouterConfig, RouterEvent, RouterStats,
};
use crate::transport::{
    encode_frame, InboundFrame, LinkDestination, SendOutcome, Transport, TransportKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Decides which transports carry a message and whether to relay it.
///
/// Routing decisions and the dedup test-and-set are synchronous; the only
/// suspension points are transport sends, each bounded by `send_timeout`.
pub struct Router {
    identity: Arc<LocalIdentity>,
    local: PeerId,
    config: RouterConfig,
    registry: Arc<PeerRegistry>,
    dedup: Arc<DedupStore>,

    /// Kept sorted by dispatch preference
    transports: RwLock<Vec<Arc<dyn Transport>>>,

    limiter: RelayRateLimiter,
    stats: RouterStatsInner,
    event_tx: Option<mpsc::Sender<RouterEvent>>,
}

#[derive(Default)]
struct RouterStatsInner {
    originated: AtomicU64,
    received: AtomicU64,
    duplicates: AtomicU64,
    invalid: AtomicU64,
    delivered: AtomicU64,
    relayed: AtomicU64,
    acks_sent: AtomicU64,
    retransmissions: AtomicU64,
}

impl Router {
    pub fn new(
        identity: Arc<LocalIdentity>,
        config: RouterConfig,
        registry: Arc<PeerRegistry>,
        dedup: Arc<DedupStore>,
    ) -> Self {
        Self {
            local: identity.peer_id(),
            identity,
            limiter: RelayRateLimiter::new(config.relay_rate_per_second),
            config,
            registry,
            dedup,
            transports: RwLock::new(Vec::new()),
            stats: RouterStatsInner::default(),
            event_tx: None,
        }
    }

    /// Push deliveries and acknowledgements to `tx`
    pub fn with_events(mut self, tx: mpsc::Sender<RouterEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Register a transport for outbound traffic only
    pub fn add_transport(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.write();
        transports.push(transport);
        transports.sort_by_key(|t| t.kind());
    }

    /// Register a transport and start feeding its inbound frames through
    /// [`on_receive`](Self::on_receive). Frames from one transport are
    /// processed in arrival order.
    pub fn attach_transport(self: &Arc<Self>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundFrame>();
        transport.subscribe(tx);
        self.add_transport(transport);

        let router = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                router.on_receive(frame).await;
            }
        })
    }

    pub fn transport_kinds(&self) -> Vec<TransportKind> {
        self.transports.read().iter().map(|t| t.kind()).collect()
    }

    fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transports.read().clone()
    }

    /// Dispatch a locally originated message.
    ///
    /// The fingerprint is recorded before anything is sent so copies echoed
    /// back by neighbors are dropped as duplicates.
    pub async fn route(&self, envelope: &MessageEnvelope) -> RouteOutcome {
        self.dedup
            .record(envelope.fingerprint, self.dedup.default_ttl());
        self.stats.originated.fetch_add(1, Ordering::Relaxed);

        let outcome = self.dispatch_local(envelope).await;
        recorder::record_route_outcome(&outcome);
        tracing::debug!(
            fingerprint = %envelope.fingerprint.short(),
            destination = %envelope.destination,
            outcome = outcome.as_str(),
            "Routed message"
        );
        outcome
    }

    async fn dispatch_local(&self, envelope: &MessageEnvelope) -> RouteOutcome {
        let transports = self.transports();
        if transports.is_empty() {
            return RouteOutcome::TransportUnavailable;
        }

        let frame = match encode_frame(self.local, envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(fingerprint = %envelope.fingerprint.short(), "Cannot encode message: {}", e);
                return RouteOutcome::TransportExhausted;
            }
        };

        let mut tally = Tally::default();
        match envelope.destination {
            Destination::Broadcast => {
                self.flood(&transports, &frame, &mut tally).await;
            }
            Destination::Peer(target) => {
                if target == self.local || !self.registry.contains(&target) {
                    return RouteOutcome::DestinationUnreachable;
                }

                // Direct link first, in preference order
                for transport in &transports {
                    if !self.registry.reachable_via(&target, transport.kind()) {
                        continue;
                    }
                    let outcome = self
                        .send_on(transport, frame.clone(), &LinkDestination::Peer(target))
                        .await;
                    tally.add(transport.kind(), outcome);
                    if outcome.is_accepted() {
                        return tally.outcome();
                    }
                }

                // No direct link took it: flood and let the mesh find a path
                self.flood(&transports, &frame, &mut tally).await;
            }
        }
        tally.outcome()
    }

    /// Broadcast on every transport at once. Outcomes are tallied in
    /// transport order.
    async fn flood(&self, transports: &[Arc<dyn Transport>], frame: &Bytes, tally: &mut Tally) {
        let destination = LinkDestination::broadcast();
        let sends = transports
            .iter()
            .map(|transport| self.send_on(transport, frame.clone(), &destination));
        let outcomes = futures::future::join_all(sends).await;
        for (transport, outcome) in transports.iter().zip(outcomes) {
            tally.add(transport.kind(), outcome);
        }
    }

    /// Process a frame received from a transport
    pub async fn on_receive(&self, frame: InboundFrame) -> ReceiveOutcome {
        let InboundFrame {
            envelope,
            from,
            via,
            address,
        } = frame;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        recorder::record_message_received(via);

        if envelope.sender == self.local || from == self.local {
            return ReceiveOutcome::dropped(DropReason::Loopback);
        }

        if let Err(e) = envelope.verify() {
            self.stats.invalid.fetch_add(1, Ordering::Relaxed);
            recorder::record_message_dropped("invalid");
            tracing::debug!(from = %from.short(), "Dropping envelope: {}", e);
            return ReceiveOutcome::dropped(DropReason::InvalidSignature);
        }

        let admission = self.admit(&envelope);
        if admission == Admission::Duplicate {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            recorder::record_message_dropped("duplicate");
            return ReceiveOutcome::dropped(DropReason::Duplicate);
        }

        let now = chrono::Utc::now().timestamp_millis();
        self.registry
            .upsert(PeerUpdate::seen(from, now).with_address(TransportAddress::new(via, address)));
        if envelope.sender != from {
            self.registry.upsert(PeerUpdate::seen(envelope.sender, now));
        }

        let mut delivered = false;
        if admission == Admission::Retransmission {
            self.stats.retransmissions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                fingerprint = %envelope.fingerprint.short(),
                sender = %envelope.sender.short(),
                "Sender retry of a message already seen"
            );
            // Delivered the first time; only the ack may have been lost
            if envelope.destination == Destination::Peer(self.local) {
                self.acknowledge(&envelope).await;
                return ReceiveOutcome::dropped(DropReason::Duplicate);
            }
        } else if envelope.is_for(&self.local) {
            delivered = self.deliver_locally(&envelope, from).await;
        }

        // Addressed to us alone: nothing to relay
        if envelope.destination == Destination::Peer(self.local) {
            return ReceiveOutcome {
                delivered,
                relayed_via: Vec::new(),
                dropped: None,
            };
        }

        let remaining = envelope.hop_count.saturating_sub(1);
        let relayed_via = if remaining == 0 {
            Vec::new()
        } else if !self.limiter.try_acquire() {
            tracing::debug!(fingerprint = %envelope.fingerprint.short(), "Relay rate limit reached");
            Vec::new()
        } else {
            self.relay(&envelope.with_hop_count(remaining), from, via)
                .await
        };

        ReceiveOutcome {
            delivered,
            relayed_via,
            dropped: None,
        }
    }

    /// Dedup verdict for an inbound envelope. Only directed messages that
    /// asked for an ack can come back as a retransmission.
    fn admit(&self, envelope: &MessageEnvelope) -> Admission {
        let ttl = self.dedup.default_ttl();
        let retried = matches!(
            envelope.kind,
            MessageKind::Data {
                ack_requested: true
            }
        ) && !envelope.destination.is_broadcast();

        if retried && !self.config.retransmit_after.is_zero() {
            self.dedup
                .admit(envelope.fingerprint, ttl, self.config.retransmit_after)
        } else if self.dedup.check_and_record(envelope.fingerprint, ttl) {
            Admission::Fresh
        } else {
            Admission::Duplicate
        }
    }

    /// Answer `envelope` with a fresh ack addressed to its originator
    async fn acknowledge(&self, envelope: &MessageEnvelope) {
        let ack = MessageEnvelope::ack_for(&self.identity, envelope, self.config.max_hops);
        let outcome = self.route(&ack).await;
        self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            of = %envelope.fingerprint.short(),
            outcome = outcome.as_str(),
            "Sent acknowledgement"
        );
    }

    async fn deliver_locally(&self, envelope: &MessageEnvelope, from: PeerId) -> bool {
        let directed = envelope.destination == Destination::Peer(self.local);

        match &envelope.kind {
            MessageKind::Data { ack_requested } => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                recorder::record_message_delivered();
                self.emit(RouterEvent::Delivered {
                    envelope: envelope.clone(),
                    from,
                })
                .await;

                if directed && *ack_requested {
                    self.acknowledge(envelope).await;
                }
                true
            }
            MessageKind::Ack { of } if directed => {
                self.emit(RouterEvent::Acknowledged {
                    fingerprint: *of,
                    by: envelope.sender,
                })
                .await;
                true
            }
            MessageKind::Ack { .. } => false,
            MessageKind::Announce { display_name } => {
                if let Some(name) = display_name {
                    let now = chrono::Utc::now().timestamp_millis();
                    self.registry.upsert(
                        PeerUpdate::seen(envelope.sender, now).with_display_name(name.clone()),
                    );
                }
                false
            }
        }
    }

    /// Forward a copy with decremented hop count. Never sent back to the
    /// immediate transmitter or the originator.
    async fn relay(
        &self,
        envelope: &MessageEnvelope,
        from: PeerId,
        arrived_on: TransportKind,
    ) -> Vec<TransportKind> {
        let frame = match encode_frame(self.local, envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Cannot re-encode relayed message: {}", e);
                return Vec::new();
            }
        };

        let mut exclude = vec![from];
        if envelope.sender != from {
            exclude.push(envelope.sender);
        }
        let transports = self.transports();

        // Directed message with a direct link to its target: one hop finishes it
        if let Destination::Peer(target) = envelope.destination {
            if !exclude.contains(&target) {
                for transport in &transports {
                    if !self.registry.reachable_via(&target, transport.kind()) {
                        continue;
                    }
                    let outcome = self
                        .send_on(transport, frame.clone(), &LinkDestination::Peer(target))
                        .await;
                    if outcome.is_accepted() {
                        self.count_relay(envelope, transport.kind());
                        return vec![transport.kind()];
                    }
                }
            }
        }

        let mut relayed_via = Vec::new();
        for transport in &transports {
            let kind = transport.kind();
            if !transport.is_available() {
                continue;
            }

            let has_other_neighbors = self
                .registry
                .neighbors(kind)
                .iter()
                .any(|peer| !exclude.contains(peer));

            if kind == arrived_on
                && (!self.config.relay_on_arrival_transport || !has_other_neighbors)
            {
                continue;
            }
            // The local mesh only reaches known neighbors; relay networks fan
            // out on their own
            if kind == TransportKind::LocalMesh && !has_other_neighbors {
                continue;
            }

            let outcome = self
                .send_on(
                    transport,
                    frame.clone(),
                    &LinkDestination::Broadcast {
                        exclude: exclude.clone(),
                    },
                )
                .await;
            if outcome.is_accepted() {
                self.count_relay(envelope, kind);
                relayed_via.push(kind);
            }
        }
        relayed_via
    }

    fn count_relay(&self, envelope: &MessageEnvelope, kind: TransportKind) {
        self.stats.relayed.fetch_add(1, Ordering::Relaxed);
        recorder::record_relay(kind);
        tracing::trace!(
            fingerprint = %envelope.fingerprint.short(),
            hops_left = envelope.hop_count,
            via = %kind,
            "Relayed message"
        );
    }

    async fn send_on(
        &self,
        transport: &Arc<dyn Transport>,
        frame: Bytes,
        destination: &LinkDestination,
    ) -> SendOutcome {
        if !transport.is_available() {
            return SendOutcome::TransportUnavailable;
        }

        let outcome =
            match tokio::time::timeout(self.config.send_timeout, transport.send(frame, destination))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(
                        transport = %transport.kind(),
                        "Send timed out after {:?}",
                        self.config.send_timeout
                    );
                    SendOutcome::TransportUnavailable
                }
            };
        recorder::record_send_outcome(transport.kind(), outcome);
        outcome
    }

    async fn emit(&self, event: RouterEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            originated: self.stats.originated.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            invalid: self.stats.invalid.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            relayed: self.stats.relayed.load(Ordering::Relaxed),
            acks_sent: self.stats.acks_sent.load(Ordering::Relaxed),
            retransmissions: self.stats.retransmissions.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn dispatch(&self, envelope: &MessageEnvelope) -> RouteOutcome {
        self.route(envelope).await
    }
}

/// Folds per-transport send outcomes into one route outcome
#[derive(Default)]
struct Tally {
    accepted: Vec<TransportKind>,
    attempted: usize,
}

impl Tally {
    fn add(&mut self, kind: TransportKind, outcome: SendOutcome) {
        match outcome {
            SendOutcome::AcceptedForTransmission => {
                self.attempted += 1;
                if !self.accepted.contains(&kind) {
                    self.accepted.push(kind);
                }
            }
            SendOutcome::DestinationUnreachable => self.attempted += 1,
            SendOutcome::TransportUnavailable => {}
        }
    }

    fn outcome(self) -> RouteOutcome {
        if !self.accepted.is_empty() {
            RouteOutcome::Dispatched { via: self.accepted }
        } else if self.attempted == 0 {
            RouteOutcome::TransportUnavailable
        } else {
            RouteOutcome::TransportExhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupConfig;
    use crate::transport::{MemoryTransport, MeshMedium};

    struct Harness {
        identity: Arc<LocalIdentity>,
        router: Router,
        registry: Arc<PeerRegistry>,
    }

    fn harness() -> Harness {
        let identity = Arc::new(LocalIdentity::generate());
        let registry = Arc::new(PeerRegistry::new());
        let dedup = Arc::new(DedupStore::new(DedupConfig::default()));
        let router = Router::new(
            identity.clone(),
            RouterConfig::default(),
            registry.clone(),
            dedup,
        );
        Harness {
            identity,
            router,
            registry,
        }
    }

    fn attach(h: &Harness, medium: &MeshMedium) -> Arc<MemoryTransport> {
        let transport = medium.attach(h.identity.peer_id());
        h.router.add_transport(transport.clone());
        transport
    }

    fn data(identity: &LocalIdentity, destination: Destination, hops: u8) -> MessageEnvelope {
        MessageEnvelope::originate(
            identity,
            destination,
            MessageKind::Data {
                ack_requested: false,
            },
            Bytes::from_static(b"payload"),
            hops,
        )
    }

    fn frame(envelope: MessageEnvelope, from: PeerId, via: TransportKind) -> InboundFrame {
        InboundFrame {
            envelope,
            from,
            via,
            address: MeshMedium::address_of(&from),
        }
    }

    #[tokio::test]
    async fn test_route_without_transports() {
        let h = harness();
        let env = data(&h.identity, Destination::Broadcast, 7);
        assert_eq!(h.router.route(&env).await, RouteOutcome::TransportUnavailable);
    }

    #[tokio::test]
    async fn test_unknown_destination_unreachable() {
        let h = harness();
        let medium = MeshMedium::relay();
        attach(&h, &medium);

        let env = data(
            &h.identity,
            Destination::Peer(PeerId::from_bytes([5; 32])),
            7,
        );
        assert_eq!(
            h.router.route(&env).await,
            RouteOutcome::DestinationUnreachable
        );
    }

    #[tokio::test]
    async fn test_directed_prefers_local_mesh() {
        let h = harness();
        let mesh = MeshMedium::local_mesh();
        let relay = MeshMedium::relay();
        let relay_t = attach(&h, &relay);
        let mesh_t = attach(&h, &mesh);

        let bob = PeerId::from_bytes([2; 32]);
        mesh.attach(bob);
        relay.attach(bob);
        mesh.link(h.identity.peer_id(), bob);
        h.registry.upsert(
            PeerUpdate::seen(bob, 1)
                .with_address(TransportAddress::new(TransportKind::LocalMesh, "m"))
        );
        h.registry.upsert(
            PeerUpdate::seen(bob, 1).with_address(TransportAddress::new(TransportKind::Relay, "r")),
        );

        let env = data(&h.identity, Destination::Peer(bob), 7);
        assert_eq!(
            h.router.route(&env).await,
            RouteOutcome::Dispatched {
                via: vec![TransportKind::LocalMesh]
            }
        );
        assert_eq!(mesh_t.accepted().len(), 1);
        assert!(relay_t.sent().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_goes_everywhere_and_is_recorded() {
        let h = harness();
        let mesh_t = attach(&h, &MeshMedium::local_mesh());
        let relay_t = attach(&h, &MeshMedium::relay());
        relay_t.set_available(false);

        let env = data(&h.identity, Destination::Broadcast, 7);
        assert_eq!(
            h.router.route(&env).await,
            RouteOutcome::Dispatched {
                via: vec![TransportKind::LocalMesh]
            }
        );
        assert_eq!(mesh_t.accepted().len(), 1);

        // Echo of our own message is not processed
        let echoed = h
            .router
            .on_receive(frame(env, PeerId::from_bytes([3; 32]), TransportKind::LocalMesh))
            .await;
        assert_eq!(echoed.dropped, Some(DropReason::Loopback));
    }

    #[tokio::test]
    async fn test_all_unavailable() {
        let h = harness();
        let mesh_t = attach(&h, &MeshMedium::local_mesh());
        mesh_t.set_available(false);

        let env = data(&h.identity, Destination::Broadcast, 7);
        assert_eq!(h.router.route(&env).await, RouteOutcome::TransportUnavailable);
    }

    #[tokio::test]
    async fn test_invalid_signature_dropped() {
        let h = harness();
        attach(&h, &MeshMedium::relay());
        let alice = LocalIdentity::generate();

        let mut env = data(&alice, Destination::Broadcast, 3);
        env.payload = Bytes::from_static(b"tampered");
        let outcome = h
            .router
            .on_receive(frame(env, alice.peer_id(), TransportKind::Relay))
            .await;

        assert_eq!(outcome.dropped, Some(DropReason::InvalidSignature));
        assert_eq!(h.router.stats().invalid, 1);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_hop_count_zero_not_relayed() {
        let h = harness();
        let relay_t = attach(&h, &MeshMedium::relay());
        let alice = LocalIdentity::generate();

        for hops in [0, 1] {
            let env = data(&alice, Destination::Broadcast, hops);
            let outcome = h
                .router
                .on_receive(frame(env, alice.peer_id(), TransportKind::LocalMesh))
                .await;
            assert!(outcome.delivered);
            assert!(outcome.relayed_via.is_empty());
        }
        assert!(relay_t.sent().is_empty());
    }

    #[tokio::test]
    async fn test_directed_to_self_not_relayed_and_acked() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut h = harness();
        h.router = Router::new(
            h.identity.clone(),
            RouterConfig::default(),
            h.registry.clone(),
            Arc::new(DedupStore::default()),
        )
        .with_events(tx);
        let relay = MeshMedium::relay();
        let relay_t = attach(&h, &relay);

        let alice = LocalIdentity::generate();
        relay.attach(alice.peer_id());
        let env = MessageEnvelope::originate(
            &alice,
            Destination::Peer(h.identity.peer_id()),
            MessageKind::Data {
                ack_requested: true,
            },
            Bytes::from_static(b"hi"),
            7,
        );
        let outcome = h
            .router
            .on_receive(frame(env.clone(), alice.peer_id(), TransportKind::Relay))
            .await;

        assert!(outcome.delivered);
        assert!(outcome.relayed_via.is_empty());
        assert!(matches!(rx.try_recv(), Ok(RouterEvent::Delivered { .. })));

        // The only transmission is the acknowledgement back to Alice
        let sent = relay_t.accepted();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].envelope.kind,
            MessageKind::Ack {
                of: env.fingerprint
            }
        );
        assert_eq!(sent[0].destination, LinkDestination::Peer(alice.peer_id()));
    }
}
