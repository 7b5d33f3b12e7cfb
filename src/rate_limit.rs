//! Per-connection click-rate limiting
//!
//! A sliding-window counter bounding how many clicks a single connection can
//! land per second. Over-limit clicks are dropped silently: the limiter is
//! an abuse guard, not a correctness mechanism, so the sender is never told
//! a click was rejected.

use std::collections::{HashMap, VecDeque};

use web_time::{Duration, SystemTime};

use crate::{constants, watcher::Id};

/// Sliding-window click-rate limiter keyed by connection id
///
/// Each connection keeps the timestamps of its clicks within the trailing
/// window. State for a connection must be purged on disconnect via
/// [`RateLimiter::forget`] to bound memory.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum number of clicks accepted within the window
    max_clicks: usize,
    /// Length of the sliding window
    window: Duration,
    /// Recent click timestamps per connection, oldest first
    clicks: HashMap<Id, VecDeque<SystemTime>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(constants::rate_limit::DEFAULT_MAX_CLICKS_PER_WINDOW)
    }
}

impl RateLimiter {
    /// Creates a limiter with the given per-second click ceiling
    pub fn new(max_clicks: usize) -> Self {
        Self {
            max_clicks,
            window: Duration::from_millis(constants::rate_limit::WINDOW_MILLIS),
            clicks: HashMap::new(),
        }
    }

    /// Checks whether a click is within the rate limit, recording it if so
    ///
    /// Timestamps older than the window are dropped first. If the remaining
    /// count is at or above the ceiling the click is rejected with no state
    /// change; otherwise `now` is appended and the click is allowed.
    ///
    /// # Arguments
    ///
    /// * `connection` - The connection the click arrived on
    /// * `now` - The arrival time of the click
    ///
    /// # Returns
    ///
    /// `true` if the click is accepted, `false` if it exceeds the limit
    pub fn check_and_record(&mut self, connection: Id, now: SystemTime) -> bool {
        let timestamps = self.clicks.entry(connection).or_default();

        let cutoff = now.checked_sub(self.window);
        while let Some(front) = timestamps.front() {
            match cutoff {
                Some(cutoff) if *front <= cutoff => {
                    timestamps.pop_front();
                }
                _ => break,
            }
        }

        if timestamps.len() >= self.max_clicks {
            return false;
        }

        timestamps.push_back(now);
        true
    }

    /// Purges all state for a connection
    ///
    /// Called on disconnect so a long-running process does not accumulate
    /// windows for connections that are gone.
    pub fn forget(&mut self, connection: Id) {
        self.clicks.remove(&connection);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn at(base: SystemTime, millis: u64) -> SystemTime {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn test_allows_up_to_ceiling_within_window() {
        let mut limiter = RateLimiter::new(20);
        let id = Id::new();
        let base = SystemTime::now();

        // 21 clicks within 900ms: exactly 20 accepted, the 21st dropped
        let accepted = (0..21)
            .filter(|i| limiter.check_and_record(id, at(base, i * 45)))
            .count();

        assert_eq!(accepted, 20);
    }

    #[test]
    fn test_rejected_click_leaves_no_state() {
        let mut limiter = RateLimiter::new(2);
        let id = Id::new();
        let base = SystemTime::now();

        assert!(limiter.check_and_record(id, at(base, 0)));
        assert!(limiter.check_and_record(id, at(base, 10)));
        assert!(!limiter.check_and_record(id, at(base, 20)));

        // Window slides past the first click; had the rejected click been
        // recorded, this one would still be over the limit.
        assert!(limiter.check_and_record(id, at(base, 1005)));
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = RateLimiter::new(3);
        let id = Id::new();
        let base = SystemTime::now();

        for i in 0..3 {
            assert!(limiter.check_and_record(id, at(base, i * 100)));
        }
        assert!(!limiter.check_and_record(id, at(base, 900)));
        assert!(limiter.check_and_record(id, at(base, 1300)));
    }

    #[test]
    fn test_connections_are_independent() {
        let mut limiter = RateLimiter::new(1);
        let a = Id::new();
        let b = Id::new();
        let base = SystemTime::now();

        assert!(limiter.check_and_record(a, base));
        assert!(limiter.check_and_record(b, base));
        assert!(!limiter.check_and_record(a, at(base, 1)));
    }

    #[test]
    fn test_forget_resets_window() {
        let mut limiter = RateLimiter::new(1);
        let id = Id::new();
        let base = SystemTime::now();

        assert!(limiter.check_and_record(id, base));
        assert!(!limiter.check_and_record(id, at(base, 1)));

        limiter.forget(id);
        assert!(limiter.check_and_record(id, at(base, 2)));
    }
}
