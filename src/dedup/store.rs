use crate::dedup::types::{Admission, DedupConfig, DedupStats};
use crate::message::Fingerprint;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Entry {
    expires_at: Instant,
    /// Last time the fingerprint was let through
    admitted_at: Instant,
    /// Insertion sequence, matches the FIFO slot that owns this entry
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Fingerprint, Entry>,
    /// Insertion order; slots whose seq no longer matches are skipped
    order: VecDeque<(Fingerprint, u64)>,
    next_seq: u64,
    stats: DedupStats,
}

impl Inner {
    fn insert(&mut self, fingerprint: Fingerprint, now: Instant, expires_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            fingerprint,
            Entry {
                expires_at,
                admitted_at: now,
                seq,
            },
        );
        self.order.push_back((fingerprint, seq));
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let Some((fingerprint, seq)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&fingerprint).map(|e| e.seq) == Some(seq) {
                self.entries.remove(&fingerprint);
                self.stats.evictions += 1;
            }
        }
    }

    /// Live (unexpired) entry for `fingerprint`, dropping it if expired
    fn live(&mut self, fingerprint: &Fingerprint, now: Instant) -> bool {
        match self.entries.get(fingerprint) {
            Some(entry) if entry.expires_at > now => true,
            Some(_) => {
                self.entries.remove(fingerprint);
                self.stats.expirations += 1;
                false
            }
            None => false,
        }
    }
}

/// Bounded, time-windowed set of seen message fingerprints.
///
/// Every operation takes one lock and never awaits, so
/// [`check_and_record`](Self::check_and_record) is an atomic test-and-set.
/// When full, the oldest insertion is evicted first.
pub struct DedupStore {
    inner: Mutex<Inner>,
    config: DedupConfig,
}

impl DedupStore {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Whether an unexpired record of `fingerprint` exists
    pub fn seen(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        self.inner.lock().live(fingerprint, now)
    }

    /// Record `fingerprint` for `ttl`. Re-recording extends the expiry but
    /// keeps the original eviction position.
    pub fn record(&self, fingerprint: Fingerprint, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now + ttl;
        let mut inner = self.inner.lock();

        if inner.live(&fingerprint, now) {
            if let Some(entry) = inner.entries.get_mut(&fingerprint) {
                entry.expires_at = entry.expires_at.max(expires_at);
            }
            return;
        }

        inner.insert(fingerprint, now, expires_at);
        inner.evict_to(self.config.capacity);
    }

    /// Atomic test-and-set. Returns `true` if the fingerprint was unseen and
    /// is now recorded; concurrent callers with the same fingerprint get
    /// `true` exactly once.
    pub fn check_and_record(&self, fingerprint: Fingerprint, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.live(&fingerprint, now) {
            inner.stats.hits += 1;
            return false;
        }

        inner.stats.misses += 1;
        inner.insert(fingerprint, now, now + ttl);
        inner.evict_to(self.config.capacity);
        true
    }

    /// Test-and-set that lets a repeat through once the fingerprint has been
    /// quiet for `quiet`. A readmitted fingerprint starts a new quiet period
    /// and keeps its expiry.
    pub fn admit(&self, fingerprint: Fingerprint, ttl: Duration, quiet: Duration) -> Admission {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if !inner.live(&fingerprint, now) {
            inner.stats.misses += 1;
            inner.insert(fingerprint, now, now + ttl);
            inner.evict_to(self.config.capacity);
            return Admission::Fresh;
        }

        inner.stats.hits += 1;
        match inner.entries.get_mut(&fingerprint) {
            Some(entry) if now.duration_since(entry.admitted_at) >= quiet => {
                entry.admitted_at = now;
                Admission::Retransmission
            }
            _ => Admission::Duplicate,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - inner.entries.len();
        inner.stats.expirations += removed as u64;

        let Inner { entries, order, .. } = &mut *inner;
        order.retain(|(fp, seq)| entries.get(fp).map(|e| e.seq) == Some(*seq));

        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.lock();
        DedupStats {
            entries: inner.entries.len(),
            ..inner.stats.clone()
        }
    }
}

impl Default for DedupStore {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
