//! Mesh node
//!
//! Owns one of each core component and the background work that ties them
//! together:
//! - router events feed local delivery and acknowledgements
//! - peers becoming reachable cut pending retry backoffs short
//! - a periodic maintenance cycle purges dedup, ages peers and persists
//! - an optional presence beacon lets neighbors discover this node

mod error;
#[allow(clippy::module_inception)]
mod node;
mod types;

pub use error::{NodeError, NodeResult};
pub use node::{MeshNode, MeshNodeBuilder};
pub use types::{BootstrapReport, MaintenanceReport, ReceivedMessage, SendReceipt};
