//! Exponential back-off schedules
//!
//! Back-off appears in three distinct places with distinct constants:
//! monitor polling, retry-on-failure, and pool-saturated requeue. They are
//! kept as three configured instances of one type, never collapsed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capped exponential back-off: `min(base * 2^attempt, max)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Base delay, seconds
    pub base_secs: f64,

    /// Delay ceiling, seconds
    pub max_secs: f64,

    /// Jitter factor (0.0 - 1.0) to spread contending workers
    #[serde(default)]
    pub jitter: f64,
}

impl Backoff {
    /// Create a schedule with no jitter
    pub const fn new(base_secs: f64, max_secs: f64) -> Self {
        Self { base_secs, max_secs, jitter: 0.0 }
    }

    /// Monitor poll schedule defaults (1 s doubling up to 30 s)
    pub const fn monitor_poll() -> Self {
        Self::new(1.0, 30.0)
    }

    /// Retry-on-failure schedule defaults (5 s doubling up to 10 m)
    pub const fn retry() -> Self {
        Self::new(5.0, 600.0)
    }

    /// Pool-saturated requeue schedule defaults (2 s doubling up to 60 s)
    pub const fn requeue() -> Self {
        Self::new(2.0, 60.0)
    }

    /// Delay before attempt number `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^attempt saturates well before f64 overflows for any sane input
        let exp = self.base_secs * 2f64.powi(attempt.min(63) as i32);
        let capped = exp.min(self.max_secs).max(0.0);

        let jittered = if self.jitter > 0.0 {
            use rand::Rng;
            let range = capped * self.jitter.clamp(0.0, 1.0);
            let mut rng = rand::thread_rng();
            (capped + rng.gen_range(-range..=range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling() {
        let b = Backoff::new(1.0, 30.0);
        assert_eq!(b.delay(0), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_secs(2));
        assert_eq!(b.delay(2), Duration::from_secs(4));
        assert_eq!(b.delay(4), Duration::from_secs(16));
    }

    #[test]
    fn test_cap() {
        let b = Backoff::new(1.0, 30.0);
        assert_eq!(b.delay(5), Duration::from_secs(30));
        assert_eq!(b.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_three_schedules_are_distinct() {
        assert_eq!(Backoff::monitor_poll().delay(0), Duration::from_secs(1));
        assert_eq!(Backoff::retry().delay(0), Duration::from_secs(5));
        assert_eq!(Backoff::retry().delay(10), Duration::from_secs(600));
        assert_eq!(Backoff::requeue().delay(0), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_bounds() {
        let b = Backoff { base_secs: 4.0, max_secs: 60.0, jitter: 0.5 };
        for attempt in 0..8 {
            let exact = Backoff::new(4.0, 60.0).delay(attempt).as_secs_f64();
            let d = b.delay(attempt).as_secs_f64();
            assert!(d >= exact * 0.5 - 1e-9 && d <= exact * 1.5 + 1e-9);
        }
    }
}
