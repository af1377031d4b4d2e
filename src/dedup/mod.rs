//! Duplicate suppression
//!
//! Remembers message fingerprints for a bounded time so a message flooded
//! through the mesh is processed and relayed at most once per node.

mod store;
mod types;

pub use store::DedupStore;
pub use types::{Admission, DedupConfig, DedupStats};
