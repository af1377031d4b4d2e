//! bitmesh: message routing core for a peer-to-peer mesh
//!
//! Messages travel over a local mesh (UDP datagrams between neighbors) and
//! an internet relay network (QUIC), are deduplicated by fingerprint,
//! relayed hop by hop and, when directed, acknowledged end to end.

pub mod config;
pub mod dedup;
pub mod delivery;
pub mod message;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod router;
pub mod transport;

pub use config::{ConfigError, NodeConfig};
pub use message::{Destination, Fingerprint, MessageEnvelope};
pub use node::{MeshNode, MeshNodeBuilder, NodeError, NodeResult, ReceivedMessage, SendReceipt};
pub use peer::{LocalIdentity, PeerId};
