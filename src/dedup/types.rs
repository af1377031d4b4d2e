use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retention policy for seen fingerprints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a fingerprint suppresses re-processing
    #[serde(with = "crate::config::duration_ms")]
    pub default_ttl: Duration,

    /// Upper bound on stored fingerprints
    pub capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            capacity: 10_000,
        }
    }
}

/// Verdict of [`DedupStore::admit`](crate::dedup::DedupStore::admit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; now recorded
    Fresh,
    /// Seen before, but quiet long enough to be a sender's retry
    Retransmission,
    Duplicate,
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub entries: usize,
    /// Test-and-set calls that found a live record
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because the store was full
    pub evictions: u64,
    pub expirations: u64,
}
