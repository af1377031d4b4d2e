use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Stable peer identity: the peer's Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid peer id hex: {e}"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| format!("peer id must be 32 bytes, got {}", v.len()))?;
        Ok(Self(bytes))
    }
}

/// Where a peer can be reached on one transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportAddress {
    pub kind: TransportKind,
    pub address: String,
}

impl TransportAddress {
    pub fn new(kind: TransportKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }
}

/// Everything the registry knows about a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,

    /// Peer-supplied, may change at any time
    pub display_name: Option<String>,

    pub favorite: bool,

    /// Unix timestamp in milliseconds of the last receipt
    pub last_seen: i64,

    pub addresses: BTreeSet<TransportAddress>,

    /// No direct receipt within the staleness window
    pub stale: bool,
}

impl PeerIdentity {
    pub fn new(id: PeerId, last_seen: i64) -> Self {
        Self {
            id,
            display_name: None,
            favorite: false,
            last_seen,
            addresses: BTreeSet::new(),
            stale: false,
        }
    }

    pub fn has_address(&self, kind: TransportKind) -> bool {
        self.addresses.iter().any(|a| a.kind == kind)
    }

    /// Local-mesh links go stale; relay addresses are global
    pub fn reachable_via(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::LocalMesh => !self.stale && self.has_address(kind),
            TransportKind::Relay => self.has_address(kind),
        }
    }

    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{name} ({})", self.id.short()),
            None => self.id.short(),
        }
    }
}

/// Information merged into the registry on contact
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub id: PeerId,
    pub seen_at: i64,
    pub address: Option<TransportAddress>,
    pub display_name: Option<String>,
}

impl PeerUpdate {
    pub fn seen(id: PeerId, seen_at: i64) -> Self {
        Self {
            id,
            seen_at,
            address: None,
            display_name: None,
        }
    }

    pub fn with_address(mut self, address: TransportAddress) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Change notifications pushed by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Discovered(PeerId),
    /// Address set or display name changed
    Updated(PeerId),
    /// A stale peer was heard from directly again
    Revived(PeerId),
    WentStale(PeerId),
    FavoriteChanged { id: PeerId, favorite: bool },
}

impl PeerEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            PeerEvent::Discovered(id)
            | PeerEvent::Updated(id)
            | PeerEvent::Revived(id)
            | PeerEvent::WentStale(id) => *id,
            PeerEvent::FavoriteChanged { id, .. } => *id,
        }
    }

    /// Whether the peer may have just become reachable
    pub fn is_reachability_gain(&self) -> bool {
        matches!(
            self,
            PeerEvent::Discovered(_) | PeerEvent::Updated(_) | PeerEvent::Revived(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId::from_bytes([0xab; 32]);
        let parsed: PeerId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short(), "abababab");
    }

    #[test]
    fn test_peer_id_rejects_wrong_length() {
        assert!("abcd".parse::<PeerId>().is_err());
        assert!("zz".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_stale_mesh_peer_is_not_reachable() {
        let mut peer = PeerIdentity::new(PeerId::from_bytes([1; 32]), 0);
        peer.addresses
            .insert(TransportAddress::new(TransportKind::LocalMesh, "10.0.0.2:7946"));
        peer.addresses
            .insert(TransportAddress::new(TransportKind::Relay, "relay-1"));

        assert!(peer.reachable_via(TransportKind::LocalMesh));
        peer.stale = true;
        assert!(!peer.reachable_via(TransportKind::LocalMesh));
        assert!(peer.reachable_via(TransportKind::Relay));
    }
}
