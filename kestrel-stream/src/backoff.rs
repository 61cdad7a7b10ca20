//! Reconnect backoff schedule.

use std::time::Duration;

use rand::Rng;

/// Reconnect policy: exponential growth from `base_delay`, capped at
/// `max_delay`, with uniform jitter layered on top. `max_attempts`
/// bounds consecutive failed reconnects before the stream gives up.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            jitter: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    /// Deterministic portion of the delay before reconnect `attempt`
    /// (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Full delay including jitter, sampled fresh per call.
    #[must_use]
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        self.delay_for(attempt) + Duration::from_millis(jitter_ms)
    }

    /// Whether another reconnect attempt is allowed.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn delays_are_strictly_increasing_below_cap() {
        let policy = ReconnectPolicy::default();
        for attempt in 1..6 {
            assert!(policy.delay_for(attempt + 1) > policy.delay_for(attempt));
        }
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = ReconnectPolicy::default();
        for _ in 0..50 {
            let full = policy.jittered_delay(1);
            assert!(full >= Duration::from_secs(1));
            assert!(full <= Duration::from_secs(1) + Duration::from_millis(500));
        }
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(policy.allows(3));
        assert!(!policy.allows(4));
    }
}
