use rand::Rng;
use std::time::Duration;

use crate::shared::domain::errors::ProviderError;

use super::CODE_CIRCUIT_OPEN;

/// Exponential backoff with full jitter: attempt n sleeps
/// `rand(0, base * 2^(n-1))`. Only transient provider faults are retried;
/// a short-circuited call is terminal for the current invocation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, error: &ProviderError, attempt: u32) -> bool {
        attempt < self.max_attempts
            && error.is_retryable()
            && error.code.as_deref() != Some(CODE_CIRCUIT_OPEN)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self.backoff_base.as_millis() as u64 * (1u64 << exponent);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(0..=ceiling);
        Duration::from_millis(jittered)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::domain::errors::ProviderErrorKind;

    fn err(kind: ProviderErrorKind) -> ProviderError {
        ProviderError::new("stripe", kind, "boom")
    }

    #[test]
    fn retries_only_transient_kinds_within_budget() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));

        assert!(policy.should_retry(&err(ProviderErrorKind::Network), 1));
        assert!(policy.should_retry(&err(ProviderErrorKind::Timeout), 2));
        assert!(!policy.should_retry(&err(ProviderErrorKind::Network), 3));
        assert!(!policy.should_retry(&err(ProviderErrorKind::Auth), 1));
        assert!(!policy.should_retry(&err(ProviderErrorKind::InvalidRequest), 1));
    }

    #[test]
    fn short_circuited_calls_are_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        let open = err(ProviderErrorKind::ProviderInternal).with_code(CODE_CIRCUIT_OPEN);
        assert!(!policy.should_retry(&open, 1));
    }

    #[test]
    fn full_jitter_stays_under_the_exponential_ceiling() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));

        for _ in 0..100 {
            assert!(policy.delay_for(1) <= Duration::from_secs(2));
            assert!(policy.delay_for(2) <= Duration::from_secs(4));
            assert!(policy.delay_for(3) <= Duration::from_secs(8));
        }
    }
}
