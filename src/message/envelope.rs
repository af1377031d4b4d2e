use crate::message::types::{Destination, EnvelopeError, Fingerprint, MessageKind};
use crate::peer::{verify_signature, LocalIdentity, PeerId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

const FINGERPRINT_DOMAIN: &[u8] = b"bitmesh/envelope/v1";

/// A routed message with its routing header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub fingerprint: Fingerprint,

    /// Originator, not the immediate transmitter
    pub sender: PeerId,

    pub destination: Destination,

    pub kind: MessageKind,

    pub payload: Bytes,

    /// Remaining relay forwards
    pub hop_count: u8,

    pub nonce: u64,

    /// Unix timestamp in milliseconds
    pub created_at: i64,

    /// Originator's Ed25519 signature over the fingerprint
    pub signature: Vec<u8>,
}

impl MessageEnvelope {
    /// Build and sign a new envelope from the local identity
    pub fn originate(
        identity: &LocalIdentity,
        destination: Destination,
        kind: MessageKind,
        payload: impl Into<Bytes>,
        hop_count: u8,
    ) -> Self {
        let sender = identity.peer_id();
        let payload = payload.into();
        let nonce = rand::random::<u64>();
        let created_at = chrono::Utc::now().timestamp_millis();

        let fingerprint = compute_fingerprint(
            &sender,
            &destination,
            &kind,
            &payload,
            nonce,
            created_at,
        );
        let signature = identity.sign(fingerprint.as_bytes()).to_vec();

        Self {
            fingerprint,
            sender,
            destination,
            kind,
            payload,
            hop_count,
            nonce,
            created_at,
            signature,
        }
    }

    /// Receipt for `original`, addressed back to its originator
    pub fn ack_for(identity: &LocalIdentity, original: &MessageEnvelope, hop_count: u8) -> Self {
        Self::originate(
            identity,
            Destination::Peer(original.sender),
            MessageKind::Ack {
                of: original.fingerprint,
            },
            Bytes::new(),
            hop_count,
        )
    }

    /// Broadcast presence beacon
    pub fn announce(identity: &LocalIdentity, display_name: Option<String>, hop_count: u8) -> Self {
        Self::originate(
            identity,
            Destination::Broadcast,
            MessageKind::Announce { display_name },
            Bytes::new(),
            hop_count,
        )
    }

    /// Check that the fingerprint matches the contents and that the
    /// originator signed it
    pub fn verify(&self) -> Result<(), EnvelopeError> {
        let expected = compute_fingerprint(
            &self.sender,
            &self.destination,
            &self.kind,
            &self.payload,
            self.nonce,
            self.created_at,
        );
        if expected != self.fingerprint {
            return Err(EnvelopeError::FingerprintMismatch);
        }
        if !verify_signature(&self.sender, self.fingerprint.as_bytes(), &self.signature) {
            return Err(EnvelopeError::InvalidSignature(self.sender.short()));
        }
        Ok(())
    }

    /// Copy with a different hop count; the fingerprint is unaffected
    pub fn with_hop_count(&self, hop_count: u8) -> Self {
        Self {
            hop_count,
            ..self.clone()
        }
    }

    /// Whether `peer` should deliver this message locally
    pub fn is_for(&self, peer: &PeerId) -> bool {
        match self.destination {
            Destination::Peer(target) => target == *peer,
            Destination::Broadcast => true,
        }
    }

    pub fn ack_requested(&self) -> bool {
        matches!(self.kind, MessageKind::Data { ack_requested: true })
    }
}

fn compute_fingerprint(
    sender: &PeerId,
    destination: &Destination,
    kind: &MessageKind,
    payload: &[u8],
    nonce: u64,
    created_at: i64,
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update(sender.as_bytes());
    hasher.update(&nonce.to_le_bytes());
    hasher.update(&created_at.to_le_bytes());

    match destination {
        Destination::Peer(id) => {
            hasher.update(&[0]);
            hasher.update(id.as_bytes());
        }
        Destination::Broadcast => {
            hasher.update(&[1]);
        }
    }

    match kind {
        MessageKind::Data { ack_requested } => {
            hasher.update(&[0, *ack_requested as u8]);
        }
        MessageKind::Ack { of } => {
            hasher.update(&[1]);
            hasher.update(of.as_bytes());
        }
        MessageKind::Announce { display_name } => {
            hasher.update(&[2]);
            match display_name {
                Some(name) => {
                    hasher.update(&[1]);
                    hasher.update(&(name.len() as u64).to_le_bytes());
                    hasher.update(name.as_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
    }

    hasher.update(&(payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}
