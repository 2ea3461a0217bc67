use crate::cache::key::ResourceKey;
use dashmap::DashMap;
use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in for `next_eligible` when `now + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Decides how long a key must wait before it is handed out again.
pub trait RateLimiter: Send + Sync {
    /// Records one more failed attempt for `key` and returns the delay to
    /// wait before the next one.
    fn when(&self, key: &ResourceKey) -> Duration;

    /// Clears all failure history for `key`.
    fn forget(&self, key: &ResourceKey);

    /// Consecutive failures recorded since the last `forget`.
    fn num_requeues(&self, key: &ResourceKey) -> u32;
}

/// Failure history of a single key.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub failures: u32,
    pub next_eligible: Instant,
}

/// `base_delay * 2^failures`, capped at `max_delay`.
pub struct ItemExponentialFailureRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    backoffs: DashMap<ResourceKey, Backoff>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            backoffs: DashMap::new(),
        }
    }

    pub fn backoff(&self, key: &ResourceKey) -> Option<Backoff> {
        self.backoffs.get(key).map(|entry| *entry)
    }

    fn delay_for(&self, exp: u32) -> Duration {
        let Some(factor) = 1u128.checked_shl(exp) else {
            return self.max_delay;
        };
        match self.base_delay.as_nanos().checked_mul(factor) {
            Some(nanos) if nanos <= self.max_delay.as_nanos() => {
                u64::try_from(nanos).map(Duration::from_nanos).unwrap_or(self.max_delay)
            }
            _ => self.max_delay,
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &ResourceKey) -> Duration {
        let now = Instant::now();
        let mut entry = self.backoffs.entry(key.clone()).or_insert(Backoff {
            failures: 0,
            next_eligible: now,
        });
        let delay = self.delay_for(entry.failures);
        entry.failures = entry.failures.saturating_add(1);
        entry.next_eligible = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        delay
    }

    fn forget(&self, key: &ResourceKey) {
        self.backoffs.remove(key);
    }

    fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.backoffs.get(key).map(|entry| entry.failures).unwrap_or(0)
    }
}

/// Feeds `governor` from tokio's clock, so the bucket and the per-key backoff
/// agree on the time, paused test clock included.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        Instant::now().into_std()
    }
}

type DirectRateLimiter =
    governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

/// Slots handed out after the bucket ran dry.
#[derive(Debug, Default)]
struct Reservations {
    /// Slots whose tokens have not been taken from the bucket yet.
    owed: u32,
    /// Latest slot handed out.
    last: Option<Instant>,
}

/// Overall token bucket shared by every key. It keeps a burst of failures
/// across many keys from hammering the remote side, but tracks nothing per
/// key.
///
/// Once the burst is spent every caller reserves the next free slot, one
/// replenish interval after the previous one, so waiters are spread out
/// instead of all firing together.
pub struct BucketRateLimiter {
    limiter: DirectRateLimiter,
    clock: TokioClock,
    interval: Duration,
    burst: u32,
    reservations: Mutex<Reservations>,
}

impl BucketRateLimiter {
    pub fn new(qps: u32, burst: u32) -> Self {
        let qps = NonZeroU32::new(qps).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(qps).allow_burst(burst);
        Self {
            limiter: governor::RateLimiter::direct_with_clock(quota, TokioClock),
            clock: TokioClock,
            interval: quota.replenish_interval(),
            burst: burst.get(),
            reservations: Mutex::new(Reservations::default()),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &ResourceKey) -> Duration {
        let now = Instant::now();
        let mut reservations = self
            .reservations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(last) = reservations.last {
            if last > now {
                let slot = last.checked_add(self.interval).unwrap_or(last);
                reservations.owed = reservations.owed.saturating_add(1);
                reservations.last = Some(slot);
                return slot - now;
            }
            // Every reserved slot has come due. Charge their tokens, except
            // those the bucket has refilled since the last slot anyway.
            let refilled = (now - last).as_nanos() / self.interval.as_nanos().max(1);
            let charge = u128::from(self.burst)
                .saturating_sub(refilled)
                .min(u128::from(reservations.owed));
            for _ in 0..charge {
                if self.limiter.check().is_err() {
                    break;
                }
            }
            *reservations = Reservations::default();
        }

        match self.limiter.check() {
            Ok(()) => Duration::ZERO,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                reservations.owed = 1;
                reservations.last = Some(now.checked_add(wait).unwrap_or(now));
                wait
            }
        }
    }

    fn forget(&self, _key: &ResourceKey) {}

    fn num_requeues(&self, _key: &ResourceKey) -> u32 {
        0
    }
}

/// Waits for the slowest of its limiters.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &ResourceKey) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &ResourceKey) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff combined with an overall token bucket.
pub fn default_controller_rate_limiter(
    base_delay: Duration,
    max_delay: Duration,
    qps: u32,
    burst: u32,
) -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(base_delay, max_delay)),
        Box::new(BucketRateLimiter::new(qps, burst)),
    ])
}
