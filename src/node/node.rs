//! Mesh node: wires identity, peer registry, dedup, router, transports and
//! delivery tracking together and runs their background loops.

use crate::config::NodeConfig;
use crate::dedup::DedupStore;
use crate::delivery::{DeliveryState, DeliveryTracker, DeliveryUpdate, Dispatcher};
use crate::message::{Destination, Fingerprint, MessageEnvelope, MessageKind};
use crate::metrics::{recorder, start_metrics_server};
use crate::node::error::{NodeError, NodeResult};
use crate::node::types::{BootstrapReport, MaintenanceReport, ReceivedMessage, SendReceipt};
use crate::peer::{
    LocalIdentity, PeerId, PeerIdentity, PeerRegistry, PeerStore, SqlitePeerStore,
};
use crate::router::{RouteOutcome, Router, RouterEvent};
use crate::transport::{
    QuicRelayTransport, Transport, TransportError, TransportKind, UdpMeshTransport,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const ROUTER_EVENT_CAPACITY: usize = 1024;
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

struct NodeInner {
    identity: Arc<LocalIdentity>,
    config: NodeConfig,
    registry: Arc<PeerRegistry>,
    dedup: Arc<DedupStore>,
    router: Arc<Router>,
    tracker: DeliveryTracker,
    messages: broadcast::Sender<ReceivedMessage>,
    running: AtomicBool,
}

/// A running mesh participant
pub struct MeshNode {
    inner: Arc<NodeInner>,
    udp: Option<Arc<UdpMeshTransport>>,
    quic: Option<Arc<QuicRelayTransport>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Start a node from configuration alone
    pub async fn start(config: NodeConfig) -> NodeResult<(Self, BootstrapReport)> {
        MeshNodeBuilder::new(config).start().await
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.router.local_peer()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.inner.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn dedup(&self) -> &Arc<DedupStore> {
        &self.inner.dedup
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    /// Bound address of the local-mesh socket, if running
    pub fn mesh_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|udp| udp.local_addr().ok())
    }

    /// Bound address of the relay endpoint, if running
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.quic.as_ref().and_then(|quic| quic.local_addr().ok())
    }

    /// Send an application payload.
    ///
    /// Directed messages request an acknowledgement and are tracked until
    /// acknowledged or abandoned. Broadcasts are routed once.
    pub async fn send(
        &self,
        destination: Destination,
        payload: impl Into<Bytes>,
    ) -> NodeResult<SendReceipt> {
        if !self.inner.running.load(Ordering::Relaxed) {
            return Err(NodeError::ShutDown);
        }

        let payload = payload.into();
        let max = self.inner.config.max_payload_bytes;
        if payload.len() > max {
            return Err(NodeError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let hops = self.inner.config.router.max_hops;
        match destination {
            Destination::Peer(peer) if peer == self.peer_id() => Err(NodeError::SelfDestination),
            Destination::Peer(peer) => {
                let envelope = MessageEnvelope::originate(
                    &self.inner.identity,
                    Destination::Peer(peer),
                    MessageKind::Data {
                        ack_requested: true,
                    },
                    payload,
                    hops,
                );
                let fingerprint = envelope.fingerprint;
                let state = self.inner.tracker.track(envelope)?;
                Ok(SendReceipt::Tracked {
                    fingerprint,
                    destination: peer,
                    state,
                })
            }
            Destination::Broadcast => {
                let envelope = MessageEnvelope::originate(
                    &self.inner.identity,
                    Destination::Broadcast,
                    MessageKind::Data {
                        ack_requested: false,
                    },
                    payload,
                    hops,
                );
                let fingerprint = envelope.fingerprint;
                let outcome = self.inner.router.route(&envelope).await;
                Ok(SendReceipt::Broadcast {
                    fingerprint,
                    outcome,
                })
            }
        }
    }

    /// Payloads delivered to this node, directed or broadcast
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.inner.messages.subscribe()
    }

    /// State of an in-flight directed message; `None` once settled
    pub fn delivery_status(&self, fingerprint: &Fingerprint) -> Option<DeliveryState> {
        self.inner.tracker.status(fingerprint)
    }

    /// Terminal outcome of every tracked message
    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.inner.tracker.subscribe_all()
    }

    pub fn cancel(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.tracker.cancel(fingerprint)
    }

    pub fn set_favorite(&self, peer: &PeerId, favorite: bool) -> bool {
        self.inner.registry.mark_favorite(peer, favorite)
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.inner.registry.snapshot()
    }

    /// Broadcast a presence beacon now
    pub async fn announce(&self) -> RouteOutcome {
        announce(&self.inner).await
    }

    /// Purge expired dedup entries, age out silent peers and persist
    pub async fn maintenance_cycle(&self) -> MaintenanceReport {
        maintenance_cycle(&self.inner).await
    }

    /// Abandon in-flight deliveries, stop background loops and close sockets.
    ///
    /// The peer table gets one last persistence attempt.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::Relaxed) {
            return;
        }

        self.inner.tracker.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(udp) = &self.udp {
            udp.close();
        }
        if let Some(quic) = &self.quic {
            quic.close();
        }

        let persisted = self.inner.registry.persist().await;
        tracing::info!(peer = %self.peer_id().short(), persisted, "Node shut down");
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Builder for mesh nodes
pub struct MeshNodeBuilder {
    config: NodeConfig,
    identity: Option<LocalIdentity>,
    peer_store: Option<Arc<dyn PeerStore>>,
    transports: Vec<Arc<dyn Transport>>,
}

impl MeshNodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            identity: None,
            peer_store: None,
            transports: Vec::new(),
        }
    }

    /// Use this identity instead of loading or generating one
    pub fn identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Persist peers here instead of `database_url`
    pub fn peer_store(mut self, store: Arc<dyn PeerStore>) -> Self {
        self.peer_store = Some(store);
        self
    }

    /// Attach an extra transport alongside the configured ones
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub async fn start(self) -> NodeResult<(MeshNode, BootstrapReport)> {
        let MeshNodeBuilder {
            config,
            identity,
            peer_store,
            mut transports,
        } = self;
        config.validate()?;
        recorder::init_metrics();

        if let Some(metrics) = &config.metrics {
            if let Err(e) = start_metrics_server(metrics) {
                tracing::warn!("Metrics exporter not started: {}", e);
            }
        }

        let identity = match (identity, &config.identity_path) {
            (Some(identity), _) => identity,
            (None, Some(path)) => LocalIdentity::load_or_generate(path).await?,
            (None, None) => LocalIdentity::generate(),
        };
        let identity = Arc::new(identity);
        let peer_id = identity.peer_id();

        // Persistence problems degrade to a memory-only registry
        let store = match (peer_store, &config.database_url) {
            (Some(store), _) => Some(store),
            (None, Some(url)) => match SqlitePeerStore::new(url).await {
                Ok(store) => Some(Arc::new(store) as Arc<dyn PeerStore>),
                Err(e) => {
                    tracing::warn!("Cannot open peer database, continuing volatile: {}", e);
                    None
                }
            },
            (None, None) => None,
        };
        let has_store = store.is_some();
        let registry = match store {
            Some(store) => PeerRegistry::new().with_store(store),
            None => PeerRegistry::new(),
        };
        let registry = Arc::new(registry);
        let loaded_peers = registry.load().await;

        let dedup = Arc::new(DedupStore::new(config.dedup.clone()));
        let (event_tx, event_rx) = mpsc::channel(ROUTER_EVENT_CAPACITY);
        let router = Arc::new(
            Router::new(
                identity.clone(),
                config.router.clone(),
                registry.clone(),
                dedup.clone(),
            )
            .with_events(event_tx),
        );

        let mut failures = Vec::new();
        let mut udp = None;
        if let Some(mesh) = &config.mesh {
            match UdpMeshTransport::bind(mesh, peer_id).await {
                Ok(transport) => {
                    udp = Some(transport.clone());
                    transports.push(transport);
                }
                Err(e) => record_failure(&mut failures, TransportKind::LocalMesh, e),
            }
        }
        let mut quic = None;
        if let Some(relay) = &config.relay {
            match QuicRelayTransport::start(relay).await {
                Ok(transport) => {
                    quic = Some(transport.clone());
                    transports.push(transport);
                }
                Err(e) => record_failure(&mut failures, TransportKind::Relay, e),
            }
        }

        let mut tasks = Vec::new();
        for transport in transports {
            tasks.push(router.attach_transport(transport));
        }

        let tracker = DeliveryTracker::new(
            router.clone() as Arc<dyn Dispatcher>,
            config.delivery.clone(),
        );
        let (messages, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);

        let inner = Arc::new(NodeInner {
            identity,
            config,
            registry,
            dedup,
            router,
            tracker,
            messages,
            running: AtomicBool::new(true),
        });

        let peer_events = inner.registry.subscribe();
        tasks.push(tokio::spawn(pump_router_events(inner.clone(), event_rx)));
        tasks.push(tokio::spawn(nudge_on_reachability(inner.clone(), peer_events)));
        tasks.push(tokio::spawn(maintenance_loop(inner.clone())));
        if !inner.config.announce_interval.is_zero() {
            tasks.push(tokio::spawn(announce_loop(inner.clone())));
        }

        let report = BootstrapReport {
            peer_id,
            loaded_peers,
            persistent: has_store && !inner.registry.is_volatile(),
            transports: inner.router.transport_kinds(),
            failures,
        };
        tracing::info!(
            peer = %peer_id.short(),
            loaded_peers,
            persistent = report.persistent,
            transports = ?report.transports,
            "Mesh node started"
        );

        let node = MeshNode {
            inner,
            udp,
            quic,
            tasks: Mutex::new(tasks),
        };
        Ok((node, report))
    }
}

fn record_failure(
    failures: &mut Vec<(TransportKind, String)>,
    kind: TransportKind,
    error: TransportError,
) {
    tracing::warn!(transport = kind.as_str(), "Transport failed to start: {}", error);
    failures.push((kind, error.to_string()));
}

async fn pump_router_events(inner: Arc<NodeInner>, mut rx: mpsc::Receiver<RouterEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RouterEvent::Delivered { envelope, from } => {
                // No subscribers is fine
                let _ = inner
                    .messages
                    .send(ReceivedMessage::from_envelope(envelope, from));
            }
            RouterEvent::Acknowledged { fingerprint, by } => {
                inner.tracker.acknowledge(&fingerprint, &by);
            }
        }
    }
}

/// Retry waiting deliveries as soon as their destination shows up
async fn nudge_on_reachability(
    inner: Arc<NodeInner>,
    mut events: broadcast::Receiver<crate::peer::PeerEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.is_reachability_gain() => {
                let nudged = inner.tracker.nudge(&event.peer());
                if nudged > 0 {
                    tracing::debug!(peer = %event.peer().short(), nudged, "Peer reachable, retrying early");
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Peer event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn maintenance_loop(inner: Arc<NodeInner>) {
    let mut interval = tokio::time::interval(inner.config.maintenance_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        maintenance_cycle(&inner).await;
    }
}

async fn announce_loop(inner: Arc<NodeInner>) {
    let mut interval = tokio::time::interval(inner.config.announce_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        announce(&inner).await;
    }
}

async fn announce(inner: &NodeInner) -> RouteOutcome {
    let envelope = MessageEnvelope::announce(
        &inner.identity,
        inner.config.display_name.clone(),
        inner.config.router.max_hops,
    );
    let outcome = inner.router.route(&envelope).await;
    tracing::trace!(outcome = outcome.as_str(), "Announced presence");
    outcome
}

async fn maintenance_cycle(inner: &NodeInner) -> MaintenanceReport {
    let dedup_purged = inner.dedup.purge_expired();
    let now = chrono::Utc::now().timestamp_millis();
    let newly_stale = inner
        .registry
        .mark_stale_older_than(now, inner.config.stale_after)
        .len();
    let persisted = inner.registry.persist().await;

    let report = MaintenanceReport {
        dedup_purged,
        newly_stale,
        persisted,
        known_peers: inner.registry.len(),
        active_deliveries: inner.tracker.active_count(),
    };
    recorder::set_known_peers(report.known_peers);
    recorder::set_dedup_entries(inner.dedup.len());
    recorder::set_active_deliveries(report.active_deliveries);

    tracing::debug!(
        dedup_purged,
        newly_stale,
        persisted,
        known_peers = report.known_peers,
        "Maintenance cycle complete"
    );
    report
}
