//! Identity & peer registry
//!
//! Tracks every peer this node has heard from, the transport addresses it
//! can be reached on, and its favorite status. Registry changes are pushed
//! to subscribers; persistence is best-effort.

mod error;
mod identity;
mod registry;
mod store;
mod types;

pub use error::{PeerError, PeerResult};
pub use identity::{verify_signature, LocalIdentity};
pub use registry::PeerRegistry;
pub use store::{MemoryPeerStore, PeerStore, SqlitePeerStore};
pub use types::{PeerEvent, PeerId, PeerIdentity, PeerUpdate, TransportAddress};
