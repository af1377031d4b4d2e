use crate::peer::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deterministic hash identifying one message instance
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<blake3::Hash> for Fingerprint {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Final recipient of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Peer(PeerId),
    Broadcast,
}

impl Destination {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Destination::Broadcast)
    }

    pub fn peer(&self) -> Option<PeerId> {
        match self {
            Destination::Peer(id) => Some(*id),
            Destination::Broadcast => None,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Peer(id) => write!(f, "peer:{}", id.short()),
            Destination::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// What the payload means to the receiving node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Application payload
    Data { ack_requested: bool },
    /// Receipt confirmation for a directed data message
    Ack { of: Fingerprint },
    /// Periodic presence beacon carrying the sender's display name
    Announce { display_name: Option<String> },
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Data { .. } => "data",
            MessageKind::Ack { .. } => "ack",
            MessageKind::Announce { .. } => "announce",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Fingerprint does not match envelope contents")]
    FingerprintMismatch,

    #[error("Invalid signature from {0}")]
    InvalidSignature(String),
}
