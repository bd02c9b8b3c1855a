//! Failed-authentication limiter.
//!
//! Fixed-window counter keyed by client address. Once a window fills up the
//! key is either locked for `lock_duration` or, without a lock configured,
//! rejected until the window resets.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Buckets kept before idle ones are pruned.
const PRUNE_THRESHOLD: usize = 4096;

/// Result of a limiter query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether another attempt is allowed.
    pub allowed: bool,
    /// Attempts left in the current window.
    pub remaining: u32,
    /// Time until the key is usable again, 0 when allowed.
    pub retry_after_ms: u64,
    /// Whether the key is locked out.
    pub locked: bool,
}

#[derive(Debug, Clone)]
struct Bucket {
    count: u32,
    window_reset_at: Instant,
    lock_until: Option<Instant>,
}

impl Bucket {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_reset_at: now + window,
            lock_until: None,
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        now >= self.window_reset_at && self.lock_until.map_or(true, |until| now >= until)
    }
}

/// Fixed-window limiter with optional lockout.
pub struct RateLimiter {
    window: Duration,
    max: u32,
    lock_duration: Option<Duration>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u32, lock_duration: Option<Duration>) -> Self {
        Self {
            window,
            max: max.max(1),
            lock_duration,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let lock = (config.lock_secs > 0).then(|| Duration::from_secs(config.lock_secs));
        Self::new(
            Duration::from_secs(config.window_secs),
            config.max_attempts,
            lock,
        )
    }

    /// Records one failed attempt for `key`.
    pub fn hit(&self, key: &str) -> RateLimitDecision {
        self.hit_at(key, Instant::now())
    }

    /// Reports the state of `key` without counting an attempt.
    pub fn peek(&self, key: &str) -> RateLimitDecision {
        self.peek_at(key, Instant::now())
    }

    fn hit_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if buckets.len() > PRUNE_THRESHOLD {
            buckets.retain(|_, bucket| !bucket.is_idle(now));
        }

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::fresh(now, self.window));

        if let Some(until) = bucket.lock_until {
            if now < until {
                return self.locked(until, now);
            }
        }
        if now >= bucket.window_reset_at {
            *bucket = Bucket::fresh(now, self.window);
        }

        bucket.count = bucket.count.saturating_add(1);
        if bucket.count >= self.max {
            if let Some(lock) = self.lock_duration {
                let until = now + lock;
                bucket.lock_until = Some(until);
                tracing::warn!(key = %key, attempts = bucket.count, "Client locked out");
                return self.locked(until, now);
            }
        }
        self.decide(bucket, now)
    }

    fn peek_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match buckets.get(key) {
            Some(bucket) => {
                if let Some(until) = bucket.lock_until {
                    if now < until {
                        return self.locked(until, now);
                    }
                }
                if now >= bucket.window_reset_at {
                    self.open()
                } else {
                    self.decide(bucket, now)
                }
            }
            None => self.open(),
        }
    }

    fn decide(&self, bucket: &Bucket, now: Instant) -> RateLimitDecision {
        if bucket.count >= self.max {
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_ms: millis_until(bucket.window_reset_at, now),
                locked: false,
            }
        } else {
            RateLimitDecision {
                allowed: true,
                remaining: self.max - bucket.count,
                retry_after_ms: 0,
                locked: false,
            }
        }
    }

    fn open(&self) -> RateLimitDecision {
        RateLimitDecision {
            allowed: true,
            remaining: self.max,
            retry_after_ms: 0,
            locked: false,
        }
    }

    fn locked(&self, until: Instant, now: Instant) -> RateLimitDecision {
        RateLimitDecision {
            allowed: false,
            remaining: 0,
            retry_after_ms: millis_until(until, now),
            locked: true,
        }
    }
}

fn millis_until(deadline: Instant, now: Instant) -> u64 {
    deadline.saturating_duration_since(now).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);
    const LOCK: Duration = Duration::from_secs(300);

    #[test]
    fn test_peek_unknown_key_is_open() {
        let limiter = RateLimiter::new(WINDOW, 6, Some(LOCK));
        let decision = limiter.peek("1.2.3.4");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 6);
        assert!(!decision.locked);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let limiter = RateLimiter::new(WINDOW, 6, Some(LOCK));
        let now = Instant::now();
        for _ in 0..10 {
            limiter.peek_at("k", now);
        }
        assert_eq!(limiter.hit_at("k", now).remaining, 5);
    }

    #[test]
    fn test_sixth_failure_locks() {
        let limiter = RateLimiter::new(WINDOW, 6, Some(LOCK));
        let now = Instant::now();

        for expected_remaining in (1..=5).rev() {
            let decision = limiter.hit_at("k", now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let sixth = limiter.hit_at("k", now);
        assert!(!sixth.allowed);
        assert!(sixth.locked);
        assert_eq!(sixth.retry_after_ms, LOCK.as_millis() as u64);

        let seventh = limiter.peek_at("k", now + Duration::from_secs(1));
        assert!(seventh.locked);
        assert!(!seventh.allowed);
    }

    #[test]
    fn test_lock_outlasts_window() {
        let limiter = RateLimiter::new(WINDOW, 2, Some(LOCK));
        let now = Instant::now();
        limiter.hit_at("k", now);
        limiter.hit_at("k", now);

        let later = now + WINDOW + Duration::from_secs(1);
        assert!(limiter.peek_at("k", later).locked);
        assert!(limiter.hit_at("k", later).locked);

        let after_lock = now + LOCK + Duration::from_secs(1);
        let decision = limiter.peek_at("k", after_lock);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[test]
    fn test_without_lock_rejects_until_window_resets() {
        let limiter = RateLimiter::new(WINDOW, 3, None);
        let now = Instant::now();
        limiter.hit_at("k", now);
        limiter.hit_at("k", now);
        let third = limiter.hit_at("k", now);
        assert!(!third.allowed);
        assert!(!third.locked);
        assert_eq!(third.retry_after_ms, WINDOW.as_millis() as u64);

        let next_window = now + WINDOW;
        assert!(limiter.peek_at("k", next_window).allowed);
        assert_eq!(limiter.hit_at("k", next_window).remaining, 2);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(WINDOW, 1, Some(LOCK));
        let now = Instant::now();
        assert!(limiter.hit_at("a", now).locked);
        assert!(limiter.peek_at("b", now).allowed);
    }

    #[test]
    fn test_from_config_zero_lock_disables_lockout() {
        let config = RateLimitConfig {
            window_secs: 60,
            max_attempts: 1,
            lock_secs: 0,
        };
        let limiter = RateLimiter::from_config(&config);
        let decision = limiter.hit("k");
        assert!(!decision.allowed);
        assert!(!decision.locked);
    }
}
