//! Local signing identity

use crate::peer::error::{PeerError, PeerResult};
use crate::peer::types::PeerId;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;

/// The node's own Ed25519 keypair. Its public half is the node's [`PeerId`].
pub struct LocalIdentity {
    signing_key: SigningKey,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Load a hex-encoded secret key from `path`, creating one if the file
    /// does not exist yet.
    pub async fn load_or_generate(path: &Path) -> PeerResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let bytes = hex::decode(contents.trim())
                    .map_err(|e| PeerError::InvalidKey(e.to_string()))?;
                let secret: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| PeerError::InvalidKey("secret key must be 32 bytes".into()))?;
                Ok(Self::from_secret_bytes(secret))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                write_secret(path, hex::encode(identity.secret_bytes()).as_bytes()).await?;
                tracing::info!(peer = %identity.peer_id().short(), "Generated new identity");
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Create `path` readable by the owner only (0600 on Unix)
async fn write_secret(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Check an Ed25519 signature made by `signer` over `message`
pub fn verify_signature(signer: &PeerId, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(signer.as_bytes()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify_strict(message, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sign_and_verify() {
        let identity = LocalIdentity::generate();
        let signature = identity.sign(b"hello mesh");

        assert!(verify_signature(&identity.peer_id(), b"hello mesh", &signature));
        assert!(!verify_signature(&identity.peer_id(), b"hello relay", &signature));

        let other = LocalIdentity::generate();
        assert!(!verify_signature(&other.peer_id(), b"hello mesh", &signature));
    }

    #[test]
    fn test_truncated_signature_rejected() {
        let identity = LocalIdentity::generate();
        let signature = identity.sign(b"payload");
        assert!(!verify_signature(&identity.peer_id(), b"payload", &signature[..32]));
    }

    #[test]
    fn test_secret_roundtrip_keeps_peer_id() {
        let identity = LocalIdentity::generate();
        let restored = LocalIdentity::from_secret_bytes(identity.secret_bytes());
        assert_eq!(identity.peer_id(), restored.peer_id());
    }

    #[tokio::test]
    async fn test_load_or_generate_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = LocalIdentity::load_or_generate(&path).await.unwrap();
        let second = LocalIdentity::load_or_generate(&path).await.unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generated_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");
        LocalIdentity::load_or_generate(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
