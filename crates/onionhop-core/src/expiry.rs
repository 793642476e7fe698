//! Lifetime-based expiry predicates

use std::time::Duration;

use crate::types::Timestamp;

/// Fixed lifetime of a hop handler, set at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    started_at: Timestamp,
    duration: Duration,
}

impl Lifetime {
    pub fn new(started_at: Timestamp, duration: Duration) -> Self {
        Self { started_at, duration }
    }

    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn expires_at(&self) -> Timestamp {
        self.started_at.saturating_add(self.duration)
    }

    /// True once `now` reaches the expiry instant
    pub fn expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at()
    }

    /// True if the expiry instant falls within `[now, now + delta]`
    pub fn expires_soon(&self, now: Timestamp, delta: Duration) -> bool {
        let at = self.expires_at();
        at >= now && at <= now.saturating_add(delta)
    }

    /// Time remaining before expiry, zero once expired
    pub fn time_left(&self, now: Timestamp) -> Duration {
        self.expires_at().saturating_sub(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_ten_minute_lifetime() {
        let lifetime = Lifetime::new(secs(0), secs(600));

        assert!(!lifetime.expired(secs(599)));
        assert!(lifetime.expired(secs(600)));
        assert!(lifetime.expired(secs(601)));

        assert!(lifetime.expires_soon(secs(550), secs(60)));
        assert!(!lifetime.expires_soon(secs(500), secs(30)));
    }

    #[test]
    fn test_expires_soon_window_edges() {
        let lifetime = Lifetime::new(secs(100), secs(50));
        assert!(lifetime.expires_soon(secs(140), secs(10)));
        assert!(lifetime.expires_soon(secs(150), secs(0)));
        assert!(!lifetime.expires_soon(secs(139), secs(10)));
        // already past: expiry is behind the window
        assert!(!lifetime.expires_soon(secs(151), secs(10)));
    }

    #[test]
    fn test_time_left() {
        let lifetime = Lifetime::new(secs(10), secs(20));
        assert_eq!(lifetime.time_left(secs(15)), secs(15));
        assert_eq!(lifetime.time_left(secs(40)), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn expired_is_monotonic(
            start in 0u64..1_000_000,
            life in 0u64..1_000_000,
            now in 0u64..3_000_000,
            later in 0u64..1_000_000,
        ) {
            let lifetime = Lifetime::new(Duration::from_millis(start), Duration::from_millis(life));
            let now = Duration::from_millis(now);
            if lifetime.expired(now) {
                prop_assert!(lifetime.expired(now + Duration::from_millis(later)));
            }
        }
    }
}
