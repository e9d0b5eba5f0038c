//! Rate limiting for unlock attempts.
//!
//! [`TokenBucket`] caps a steady rate with a burst allowance.
//! [`SlidingWindow`] caps calls per key over a trailing period, and
//! [`KeyedLimiter`] keeps one window per key. [`UnlockGate`] puts a
//! keyed limiter and a constant inter-attempt floor in front of the KDF.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use zilfs_core::config::SessionConfig;
use zilfs_core::{ZilError, ZilResult};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// At most `rate` calls per second on average, `capacity` at once.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: u32) -> ZilResult<Self> {
        if !(rate.is_finite() && rate > 0.0) || capacity == 0 {
            return Err(ZilError::bad_argument(format!(
                "token bucket needs a positive rate and capacity (rate={rate}, capacity={capacity})"
            )));
        }
        Ok(Self {
            rate,
            capacity: f64::from(capacity),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last: Instant::now(),
            }),
        })
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// At most `max_calls` within any trailing `period`, for one key.
#[derive(Debug)]
pub struct SlidingWindow {
    key: String,
    max_calls: usize,
    period: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(key: impl Into<String>, max_calls: usize, period: Duration) -> Self {
        Self {
            key: key.into(),
            max_calls,
            period,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut calls = self.calls.lock();
        while calls
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.period)
        {
            calls.pop_front();
        }
        if calls.len() < self.max_calls {
            calls.push_back(now);
            true
        } else {
            false
        }
    }
}

/// One [`SlidingWindow`] per key, created on first use.
#[derive(Debug)]
pub struct KeyedLimiter {
    max_calls: usize,
    period: Duration,
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl KeyedLimiter {
    pub fn new(max_calls: usize, period: Duration) -> Self {
        Self {
            max_calls,
            period,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        windows
            .entry(key.to_string())
            .or_insert_with(|| SlidingWindow::new(key, self.max_calls, self.period))
            .allow_at(now)
    }
}

/// Brute-force gate consulted before every passphrase derivation.
#[derive(Debug)]
pub struct UnlockGate {
    limiter: KeyedLimiter,
    floor: Duration,
    last_attempt: Mutex<HashMap<String, Instant>>,
}

impl UnlockGate {
    pub fn new(max_attempts: usize, window: Duration, floor: Duration) -> Self {
        Self {
            limiter: KeyedLimiter::new(max_attempts, window),
            floor,
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.unlock_max_attempts,
            Duration::from_secs(config.unlock_window_secs),
            Duration::from_millis(config.unlock_floor_ms),
        )
    }

    /// Admit one unlock attempt for `key`, sleeping out the remainder of
    /// the floor since the previous attempt.
    pub fn admit(&self, key: &str) -> ZilResult<()> {
        if !self.limiter.allow(key) {
            tracing::warn!(container = key, "unlock attempt refused by rate limiter");
            return Err(ZilError::RateLimited(format!(
                "too many unlock attempts for {key}"
            )));
        }
        let wait = {
            let mut last = self.last_attempt.lock();
            let now = Instant::now();
            let wait = last
                .get(key)
                .map(|prev| self.floor.saturating_sub(now.saturating_duration_since(*prev)))
                .unwrap_or_default();
            last.insert(key.to_string(), now + wait);
            wait
        };
        if !wait.is_zero() {
            tracing::debug!(container = key, wait_ms = wait.as_millis() as u64, "unlock floor delay");
            std::thread::sleep(wait);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_refuses_after_capacity() {
        let bucket = TokenBucket::new(0.001, 3).unwrap();
        let now = Instant::now();
        assert!(bucket.allow_at(now));
        assert!(bucket.allow_at(now));
        assert!(bucket.allow_at(now));
        assert!(!bucket.allow_at(now));
    }

    #[test]
    fn bucket_refills_at_rate() {
        let bucket = TokenBucket::new(10.0, 1).unwrap();
        let t0 = Instant::now();
        assert!(bucket.allow_at(t0));
        assert!(!bucket.allow_at(t0 + Duration::from_millis(50)));
        assert!(bucket.allow_at(t0 + Duration::from_millis(160)));
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let bucket = TokenBucket::new(100.0, 2).unwrap();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(bucket.allow_at(later));
        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn bucket_rejects_nonsense() {
        assert!(TokenBucket::new(0.0, 1).is_err());
        assert!(TokenBucket::new(f64::NAN, 1).is_err());
        assert!(TokenBucket::new(1.0, 0).is_err());
    }

    #[test]
    fn window_slides() {
        let window = SlidingWindow::new("vault", 2, Duration::from_secs(10));
        let t0 = Instant::now();
        assert!(window.allow_at(t0));
        assert!(window.allow_at(t0 + Duration::from_secs(1)));
        assert!(!window.allow_at(t0 + Duration::from_secs(9)));
        assert!(window.allow_at(t0 + Duration::from_secs(10)));
        assert!(!window.allow_at(t0 + Duration::from_secs(10)));
        assert_eq!(window.key(), "vault");
    }

    #[test]
    fn keys_are_independent() {
        let limiter = KeyedLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn gate_enforces_attempt_budget_and_floor() {
        let gate = UnlockGate::new(2, Duration::from_secs(60), Duration::from_millis(30));
        let start = Instant::now();
        gate.admit("box").unwrap();
        gate.admit("box").unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(matches!(gate.admit("box"), Err(ZilError::RateLimited(_))));
        gate.admit("other").unwrap();
    }
}
