//! Relay fan-out throttling using the governor crate

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;

/// Caps how many relay fan-outs this node performs per second. Excess
/// relays are skipped rather than queued; the mesh has other paths.
pub struct RelayRateLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RelayRateLimiter {
    /// `per_second` of 0 disables limiting
    pub fn new(per_second: u32) -> Self {
        Self {
            limiter: NonZeroU32::new(per_second)
                .map(|rate| RateLimiter::direct(Quota::per_second(rate))),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Take one relay permit if available
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }
}

impl Default for RelayRateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited() {
        let limiter = RelayRateLimiter::unlimited();
        assert!(!limiter.is_enabled());
        assert!((0..10_000).all(|_| limiter.try_acquire()));
    }

    #[test]
    fn test_burst_is_capped() {
        let limiter = RelayRateLimiter::new(5);
        assert!(limiter.is_enabled());

        let granted = (0..20).filter(|_| limiter.try_acquire()).count();
        assert_eq!(granted, 5);
    }
}
