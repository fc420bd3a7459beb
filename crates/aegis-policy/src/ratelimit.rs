// ratelimit.rs — Sliding-window Rate Limiter.
//
// One window per (subject, operation-class) pair, tracked as a deque of
// timestamps; each check evicts entries older than the window before
// counting. Synchronous and lock-based — this crate has no async runtime
// dependency, so a `std::sync::Mutex` is the right tool, not a tokio one.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_events: usize,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(max_events: usize, window: Duration) -> Self {
        Self { max_events, window }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current_count: usize,
    pub limit: usize,
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record an attempt for `subject` now and decide whether it is within
    /// policy. Always records the attempt, even when denying it, so a
    /// sustained burst of denied attempts continues to count against the
    /// subject rather than resetting the window.
    pub fn check(&self, subject: &str) -> RateLimitDecision {
        self.check_at(subject, Instant::now())
    }

    fn check_at(&self, subject: &str, now: Instant) -> RateLimitDecision {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let deque = windows.entry(subject.to_string()).or_default();

        // A timestamp exactly `window` old is outside the window: a
        // timestamp exactly now - 60s is considered outside the window.
        while let Some(&front) = deque.front() {
            if now.duration_since(front) >= self.policy.window {
                deque.pop_front();
            } else {
                break;
            }
        }

        let current_count = deque.len();
        let allowed = current_count < self.policy.max_events;
        deque.push_back(now);

        RateLimitDecision {
            allowed,
            current_count: current_count + 1,
            limit: self.policy.max_events,
        }
    }

    /// Drop bookkeeping for subjects with no activity in the current
    /// window, bounding memory for long-running daemons with many distinct
    /// subjects over their lifetime.
    pub fn evict_stale(&self) {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        windows.retain(|_, deque| {
            deque.retain(|&t| now.duration_since(t) <= self.policy.window);
            !deque.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(3, Duration::from_secs(60)));
        for _ in 0..3 {
            assert!(limiter.check("agent-1").allowed);
        }
        assert!(!limiter.check("agent-1").allowed);
    }

    #[test]
    fn subjects_are_tracked_independently() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, Duration::from_secs(60)));
        assert!(limiter.check("agent-1").allowed);
        assert!(limiter.check("agent-2").allowed);
        assert!(!limiter.check("agent-1").allowed);
    }

    #[test]
    fn window_expiry_resets_the_count() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, Duration::from_millis(10)));
        let t0 = Instant::now();
        assert!(limiter.check_at("agent-1", t0).allowed);
        assert!(!limiter.check_at("agent-1", t0).allowed);
        let t1 = t0 + Duration::from_millis(20);
        assert!(limiter.check_at("agent-1", t1).allowed);
    }

    #[test]
    fn denied_attempts_still_count_against_the_window() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(2, Duration::from_secs(60)));
        let t0 = Instant::now();
        assert!(limiter.check_at("agent-1", t0).allowed);
        assert!(limiter.check_at("agent-1", t0).allowed);
        let d = limiter.check_at("agent-1", t0);
        assert!(!d.allowed);
        assert_eq!(d.current_count, 3);
    }

    #[test]
    fn timestamp_exactly_at_window_boundary_is_outside_window() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, Duration::from_secs(60)));
        let t0 = Instant::now();
        assert!(limiter.check_at("agent-1", t0).allowed);
        let at_boundary = t0 + Duration::from_secs(60);
        // The first event is now exactly 60s old — outside the window — so
        // a second event at the boundary is allowed rather than throttled.
        assert!(limiter.check_at("agent-1", at_boundary).allowed);
    }

    #[test]
    fn evict_stale_removes_empty_subject_entries() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, Duration::from_millis(5)));
        let t0 = Instant::now();
        limiter.check_at("agent-1", t0);
        std::thread::sleep(Duration::from_millis(10));
        limiter.evict_stale();
        let windows = limiter.windows.lock().unwrap();
        assert!(windows.get("agent-1").map(|d| d.is_empty()).unwrap_or(true));
    }
}
