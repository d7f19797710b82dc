/// Exponential backoff for retried store operations
///
/// delay(n) = min(base * 2^n, cap), with optional jitter that only ever
/// shortens the delay so the cap is never exceeded.
use std::time::Duration;

/// Exponential backoff retry strategy with optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Unit delay multiplied by 2^attempt (default: 1s)
    base_delay: Duration,

    /// Maximum delay cap (default: 10s)
    max_delay: Duration,

    /// Jitter factor (0.0 - 1.0) - fraction of the delay that may be shaved off
    jitter_factor: f64,
}

impl ExponentialBackoff {
    /// Create new exponential backoff strategy without jitter
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    /// Create with custom jitter factor
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after failed attempt `attempt` (1-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return capped;
        }

        let shave = capped.as_secs_f64() * self.jitter_factor * rand::random::<f64>();
        Duration::from_secs_f64((capped.as_secs_f64() - shave).max(0.0))
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        let cap_ms = self.max_delay.as_millis();
        let exponential_ms = 2_u128
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.as_millis().checked_mul(factor))
            .unwrap_or(cap_ms);

        Duration::from_millis(exponential_ms.min(cap_ms) as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_backoff_delays() {
        let backoff = ExponentialBackoff::default();

        assert_eq!(backoff.next_delay(1), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(2), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(3), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(4), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_max_delay() {
        let backoff = ExponentialBackoff::default();

        assert_eq!(backoff.next_delay(10), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(200), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_jitter_stays_below_cap() {
        let backoff = ExponentialBackoff::default().with_jitter(0.5);

        let delays: Vec<_> = (0..20).map(|_| backoff.next_delay(6)).collect();
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
        assert!(delays.iter().all(|d| *d >= Duration::from_secs(5)));
    }

    #[test]
    fn test_custom_base_and_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(1), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(2), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(3), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let backoff = ExponentialBackoff::default().with_jitter(3.0);
        assert!(backoff.next_delay(1) <= Duration::from_secs(2));
    }

    proptest! {
        #[test]
        fn prop_delay_matches_formula(attempt in 1u32..64) {
            let backoff = ExponentialBackoff::default();
            let expected = 2u64.saturating_pow(attempt).min(10);
            prop_assert_eq!(backoff.next_delay(attempt), Duration::from_secs(expected));
        }

        #[test]
        fn prop_delay_never_exceeds_cap(attempt in any::<u32>(), jitter in 0.0f64..1.0) {
            let backoff = ExponentialBackoff::default().with_jitter(jitter);
            prop_assert!(backoff.next_delay(attempt) <= Duration::from_secs(10));
        }
    }
}
