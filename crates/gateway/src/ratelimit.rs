//! Fixed-window rate limiting with a burst cap.
//!
//! One window per key (canonically `consumer:server`), 60 seconds long,
//! created lazily and recreated once expired. The admission cap is the
//! per-minute limit times the burst multiplier, rounded up. Keys are fully
//! isolated; stale windows can be collected on any schedule without
//! affecting correctness.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use tg_domain::config::RateLimitConfig;

const WINDOW_SECS: i64 = 60;

/// Admission decision for one call.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Admissions left in the current window.
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

struct Window {
    count: u32,
    reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Effective admission cap for a limit.
    fn cap(&self, limit: u32) -> u32 {
        (f64::from(limit) * self.config.burst_multiplier).ceil() as u32
    }

    /// Admit or reject one call on `key`. `override_per_minute` replaces
    /// the configured default limit for this caller.
    pub fn check(&self, key: &str, override_per_minute: Option<u32>) -> RateDecision {
        let now = Utc::now();
        if !self.config.enabled {
            return RateDecision {
                allowed: true,
                remaining: u32::MAX,
                reset_at: now,
            };
        }

        let limit = override_per_minute.unwrap_or(self.config.per_minute);
        let cap = self.cap(limit);

        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            reset_at: now + Duration::seconds(WINDOW_SECS),
        });
        if now >= window.reset_at {
            window.count = 0;
            window.reset_at = now + Duration::seconds(WINDOW_SECS);
        }

        if window.count >= cap {
            tracing::debug!(key, cap, "rate limit exceeded");
            return RateDecision {
                allowed: false,
                remaining: 0,
                reset_at: window.reset_at,
            };
        }

        window.count += 1;
        RateDecision {
            allowed: true,
            remaining: cap - window.count,
            reset_at: window.reset_at,
        }
    }

    /// Drop expired windows. Purely an allocation bound; admission logic
    /// recreates windows lazily either way.
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.windows.lock().retain(|_, w| now < w.reset_at);
    }

    /// Number of live windows (diagnostics).
    pub fn window_count(&self) -> usize {
        self.windows.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, burst: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            per_minute,
            burst_multiplier: burst,
        })
    }

    #[test]
    fn cap_is_limit_times_burst_rounded_up() {
        // limit 5 × burst 2 ⇒ cap 10: ten admissions, the eleventh rejects.
        let rl = limiter(5, 2.0);
        for i in 0..10 {
            let decision = rl.check("k", None);
            assert!(decision.allowed, "admission {i} should pass");
            assert_eq!(decision.remaining, 9 - i);
        }
        let rejected = rl.check("k", None);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
    }

    #[test]
    fn keys_are_isolated() {
        let rl = limiter(1, 1.0);
        assert!(rl.check("k1", None).allowed);
        assert!(!rl.check("k1", None).allowed);
        // Consumption on k1 does not affect k2.
        assert!(rl.check("k2", None).allowed);
    }

    #[test]
    fn override_replaces_default_limit() {
        let rl = limiter(100, 1.0);
        assert!(rl.check("k", Some(1)).allowed);
        assert!(!rl.check("k", Some(1)).allowed);
    }

    #[test]
    fn fractional_burst_rounds_up() {
        // limit 3 × burst 1.5 = 4.5 ⇒ cap 5.
        let rl = limiter(3, 1.5);
        for _ in 0..5 {
            assert!(rl.check("k", None).allowed);
        }
        assert!(!rl.check("k", None).allowed);
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let rl = RateLimiter::new(RateLimitConfig {
            enabled: false,
            per_minute: 1,
            burst_multiplier: 1.0,
        });
        for _ in 0..100 {
            assert!(rl.check("k", None).allowed);
        }
        assert_eq!(rl.window_count(), 0);
    }

    #[test]
    fn cleanup_drops_only_expired_windows() {
        let rl = limiter(5, 2.0);
        rl.check("fresh", None);
        assert_eq!(rl.window_count(), 1);
        // The window has not expired yet.
        rl.cleanup();
        assert_eq!(rl.window_count(), 1);
    }

    #[test]
    fn reset_at_is_about_a_minute_out() {
        let rl = limiter(5, 2.0);
        let decision = rl.check("k", None);
        let delta = decision.reset_at - Utc::now();
        assert!(delta.num_seconds() >= 58 && delta.num_seconds() <= 60);
    }
}
