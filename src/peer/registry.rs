use crate::peer::store::PeerStore;
use crate::peer::types::{PeerEvent, PeerId, PeerIdentity, PeerUpdate};
use crate::transport::TransportKind;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-memory peer table with change notifications and best-effort persistence.
///
/// All mutations go through a single write lock. Persistence failures never
/// surface to callers; they switch the registry to volatile mode for the
/// rest of the session.
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerIdentity>>,
    events: broadcast::Sender<PeerEvent>,
    store: Option<Arc<dyn PeerStore>>,
    volatile: AtomicBool,
    dirty: AtomicBool,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerRegistry {
    /// Registry without persistence
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            peers: RwLock::new(HashMap::new()),
            events,
            store: None,
            volatile: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PeerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Receive change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Merge contact information into the peer's record, creating it if needed.
    ///
    /// `last_seen` never moves backwards. An update carrying an address counts
    /// as direct contact and clears the stale flag.
    pub fn upsert(&self, update: PeerUpdate) -> PeerIdentity {
        let (record, event) = {
            let mut peers = self.peers.write();
            match peers.get_mut(&update.id) {
                None => {
                    let mut peer = PeerIdentity::new(update.id, update.seen_at);
                    peer.display_name = update.display_name;
                    peer.addresses.extend(update.address);
                    let record = peer.clone();
                    peers.insert(update.id, peer);
                    (record, Some(PeerEvent::Discovered(update.id)))
                }
                Some(peer) => {
                    peer.last_seen = peer.last_seen.max(update.seen_at);

                    let mut changed = false;
                    if let Some(name) = update.display_name {
                        if peer.display_name.as_deref() != Some(name.as_str()) {
                            peer.display_name = Some(name);
                            changed = true;
                        }
                    }

                    let mut revived = false;
                    if let Some(address) = update.address {
                        if peer.stale {
                            peer.stale = false;
                            revived = true;
                        }
                        changed |= peer.addresses.insert(address);
                    }

                    let event = if revived {
                        Some(PeerEvent::Revived(update.id))
                    } else if changed {
                        Some(PeerEvent::Updated(update.id))
                    } else {
                        None
                    };
                    (peer.clone(), event)
                }
            }
        };

        self.dirty.store(true, Ordering::Relaxed);
        if let Some(event) = event {
            self.emit(event);
        }
        record
    }

    pub fn lookup(&self, id: &PeerId) -> Option<PeerIdentity> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Set the favorite flag. Idempotent; returns `false` for unknown peers.
    pub fn mark_favorite(&self, id: &PeerId, favorite: bool) -> bool {
        let changed = {
            let mut peers = self.peers.write();
            match peers.get_mut(id) {
                None => return false,
                Some(peer) if peer.favorite == favorite => false,
                Some(peer) => {
                    peer.favorite = favorite;
                    true
                }
            }
        };

        if changed {
            self.dirty.store(true, Ordering::Relaxed);
            self.emit(PeerEvent::FavoriteChanged { id: *id, favorite });
        }
        true
    }

    pub fn favorites(&self) -> Vec<PeerIdentity> {
        self.peers
            .read()
            .values()
            .filter(|p| p.favorite)
            .cloned()
            .collect()
    }

    /// Whether `id` can be addressed directly on a transport of `kind`
    pub fn reachable_via(&self, id: &PeerId, kind: TransportKind) -> bool {
        self.peers
            .read()
            .get(id)
            .map(|p| p.reachable_via(kind))
            .unwrap_or(false)
    }

    /// Peers directly reachable on a transport of `kind`
    pub fn neighbors(&self, kind: TransportKind) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .read()
            .values()
            .filter(|p| p.reachable_via(kind))
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    /// Flag peers whose last receipt is older than `window` as stale
    pub fn mark_stale_older_than(&self, now_millis: i64, window: Duration) -> Vec<PeerId> {
        let cutoff = now_millis - window.as_millis() as i64;
        let staled: Vec<PeerId> = {
            let mut peers = self.peers.write();
            peers
                .values_mut()
                .filter(|p| !p.stale && p.last_seen < cutoff)
                .map(|p| {
                    p.stale = true;
                    p.id
                })
                .collect()
        };

        if !staled.is_empty() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        for id in &staled {
            self.emit(PeerEvent::WentStale(*id));
        }
        staled
    }

    pub fn snapshot(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// True once a persistence failure has been observed this session
    pub fn is_volatile(&self) -> bool {
        self.volatile.load(Ordering::Relaxed)
    }

    /// Load persisted peers. Loaded records start stale until heard from.
    ///
    /// Returns the number of records merged; failures degrade to volatile mode.
    pub async fn load(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        match store.load_peers().await {
            Ok(loaded) => {
                let count = loaded.len();
                let mut peers = self.peers.write();
                for mut peer in loaded {
                    peer.stale = true;
                    peers.entry(peer.id).or_insert(peer);
                }
                tracing::debug!(count, "Loaded persisted peers");
                count
            }
            Err(e) => {
                tracing::warn!("Peer persistence unavailable, continuing volatile: {}", e);
                self.volatile.store(true, Ordering::Relaxed);
                0
            }
        }
    }

    /// Write the current table to the store if anything changed.
    ///
    /// Returns `true` when the store holds the current state afterwards.
    pub async fn persist(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        if self.is_volatile() {
            return false;
        }
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return true;
        }

        let snapshot = self.snapshot();
        match store.save_peers(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to persist peers, continuing volatile: {}", e);
                self.volatile.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::store::MemoryPeerStore;
    use crate::peer::types::TransportAddress;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn mesh_addr(addr: &str) -> TransportAddress {
        TransportAddress::new(TransportKind::LocalMesh, addr)
    }

    #[test]
    fn test_upsert_creates_and_merges() {
        let registry = PeerRegistry::new();

        registry.upsert(PeerUpdate::seen(peer(1), 100).with_address(mesh_addr("a")));
        let merged = registry.upsert(
            PeerUpdate::seen(peer(1), 200)
                .with_address(TransportAddress::new(TransportKind::Relay, "r"))
                .with_display_name("alice"),
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(merged.addresses.len(), 2);
        assert_eq!(merged.display_name.as_deref(), Some("alice"));
        assert_eq!(merged.last_seen, 200);
    }

    #[test]
    fn test_last_seen_never_regresses() {
        let registry = PeerRegistry::new();
        registry.upsert(PeerUpdate::seen(peer(1), 500));
        let record = registry.upsert(PeerUpdate::seen(peer(1), 100));
        assert_eq!(record.last_seen, 500);
    }

    #[test]
    fn test_mark_favorite_is_idempotent() {
        let registry = PeerRegistry::new();
        registry.upsert(PeerUpdate::seen(peer(1), 1));
        let mut events = registry.subscribe();

        assert!(registry.mark_favorite(&peer(1), true));
        assert!(registry.mark_favorite(&peer(1), true));
        assert!(!registry.mark_favorite(&peer(9), true));

        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::FavoriteChanged {
                id: peer(1),
                favorite: true
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(registry.favorites().len(), 1);
    }

    #[test]
    fn test_change_events_are_pushed() {
        let registry = PeerRegistry::new();
        let mut events = registry.subscribe();

        registry.upsert(PeerUpdate::seen(peer(1), 1).with_address(mesh_addr("a")));
        // Only last_seen moves: no event
        registry.upsert(PeerUpdate::seen(peer(1), 2).with_address(mesh_addr("a")));
        registry.upsert(PeerUpdate::seen(peer(1), 3).with_display_name("bob"));

        assert_eq!(events.try_recv().unwrap(), PeerEvent::Discovered(peer(1)));
        assert_eq!(events.try_recv().unwrap(), PeerEvent::Updated(peer(1)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_stale_and_revive() {
        let registry = PeerRegistry::new();
        registry.upsert(PeerUpdate::seen(peer(1), 1_000).with_address(mesh_addr("a")));
        registry.upsert(PeerUpdate::seen(peer(2), 9_000).with_address(mesh_addr("b")));

        let staled = registry.mark_stale_older_than(10_000, Duration::from_secs(5));
        assert_eq!(staled, vec![peer(1)]);
        assert_eq!(registry.neighbors(TransportKind::LocalMesh), vec![peer(2)]);

        let mut events = registry.subscribe();
        registry.upsert(PeerUpdate::seen(peer(1), 11_000).with_address(mesh_addr("a")));
        assert_eq!(events.try_recv().unwrap(), PeerEvent::Revived(peer(1)));
        assert_eq!(registry.neighbors(TransportKind::LocalMesh).len(), 2);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = Arc::new(MemoryPeerStore::new());
        let registry = PeerRegistry::new().with_store(store.clone());
        registry.upsert(PeerUpdate::seen(peer(1), 1).with_address(mesh_addr("a")));
        registry.mark_favorite(&peer(1), true);
        assert!(registry.persist().await);

        let restored = PeerRegistry::new().with_store(store);
        assert_eq!(restored.load().await, 1);
        let record = restored.lookup(&peer(1)).unwrap();
        assert!(record.favorite);
        assert!(record.stale);
        assert!(!restored.is_volatile());
    }

    #[tokio::test]
    async fn test_persistence_failure_degrades_to_volatile() {
        let store = Arc::new(MemoryPeerStore::new());
        store.set_failing(true);
        let registry = PeerRegistry::new().with_store(store);

        assert_eq!(registry.load().await, 0);
        assert!(registry.is_volatile());

        // Still fully operational in memory
        registry.upsert(PeerUpdate::seen(peer(3), 1));
        assert!(registry.contains(&peer(3)));
        assert!(!registry.persist().await);
    }
}
