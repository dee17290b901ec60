//! Token-bucket rate limiting for inbound traffic, built on `governor`
//! the same way the teacher's connection loop rate-limits subscription
//! creation (spec.md §4.1 "Throttling").
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter as GovernorLimiter};
use std::num::NonZeroU32;
use std::time::Duration;

/// Jitter applied whenever a caller waits out a limiter, so many
/// connections released at once don't all retry in lockstep.
const DEFAULT_JITTER_MS: u64 = 100;

/// A single-connection token bucket. `None` means unlimited.
pub struct ConnLimiter {
    inner: Option<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    jitter: Jitter,
}

impl ConnLimiter {
    /// `per_second` events are allowed on average, with bursts up to
    /// `burst`. Either being `None` or zero disables limiting.
    #[must_use]
    pub fn new(per_second: Option<u32>, burst: Option<u32>) -> ConnLimiter {
        let inner = per_second.and_then(NonZeroU32::new).map(|rate| {
            let burst = burst.and_then(NonZeroU32::new).unwrap_or(rate);
            let quota = Quota::per_second(rate).allow_burst(burst);
            GovernorLimiter::direct(quota)
        });
        ConnLimiter {
            inner,
            jitter: Jitter::up_to(Duration::from_millis(DEFAULT_JITTER_MS)),
        }
    }

    /// `per_minute` events are allowed on average, bursting up to that same
    /// rate. Used for subscription-creation throttling, where the teacher's
    /// connection loop stalls the REQ handler via `until_ready` rather than
    /// rejecting outright.
    #[must_use]
    pub fn per_minute(per_minute: Option<u32>) -> ConnLimiter {
        let inner = per_minute.and_then(NonZeroU32::new).map(|rate| {
            GovernorLimiter::direct(Quota::per_minute(rate))
        });
        ConnLimiter {
            inner,
            jitter: Jitter::up_to(Duration::from_millis(DEFAULT_JITTER_MS)),
        }
    }

    #[must_use]
    pub fn unlimited() -> ConnLimiter {
        ConnLimiter {
            inner: None,
            jitter: Jitter::up_to(Duration::from_millis(DEFAULT_JITTER_MS)),
        }
    }

    /// Returns `true` if the caller may proceed immediately, `false` if
    /// the bucket is exhausted. Never blocks; the caller decides whether
    /// to reject or wait.
    #[must_use]
    pub fn check(&self) -> bool {
        match &self.inner {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    /// Wait until a slot is free (with jitter), used for subscription
    /// creation where the teacher's loop stalls rather than rejecting.
    pub async fn until_ready(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready_with_jitter(self.jitter).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_always_passes() {
        let lim = ConnLimiter::unlimited();
        for _ in 0..1000 {
            assert!(lim.check());
        }
    }

    #[test]
    fn burst_then_exhausted() {
        let lim = ConnLimiter::new(Some(1), Some(2));
        assert!(lim.check());
        assert!(lim.check());
        assert!(!lim.check());
    }

    #[test]
    fn per_minute_none_disables_limiting() {
        let lim = ConnLimiter::per_minute(None);
        for _ in 0..100 {
            assert!(lim.check());
        }
    }

    #[test]
    fn zero_rate_disables_limiting() {
        let lim = ConnLimiter::new(Some(0), None);
        for _ in 0..100 {
            assert!(lim.check());
        }
    }
}
