//! Retry backoff policy (spec.md §4.1: "default exponential: `attempt² × 10s`").

use std::time::Duration;

/// Computes the delay before a retryable job becomes available again.
pub trait RetryPolicy: Send + Sync {
    fn delay_for_attempt(&self, attempt: i16) -> Duration;
}

/// The runtime default: `attempt² × 10s`, matching spec.md exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticBackoff;

impl RetryPolicy for QuadraticBackoff {
    fn delay_for_attempt(&self, attempt: i16) -> Duration {
        let attempt = attempt.max(1) as u64;
        Duration::from_secs(attempt * attempt * 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_documented_formula() {
        let p = QuadraticBackoff;
        assert_eq!(p.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(p.delay_for_attempt(2), Duration::from_secs(40));
        assert_eq!(p.delay_for_attempt(3), Duration::from_secs(90));
    }

    #[test]
    fn clamps_nonpositive_attempts_to_one() {
        let p = QuadraticBackoff;
        assert_eq!(p.delay_for_attempt(0), Duration::from_secs(10));
    }
}
