use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

use crate::shared::domain::errors::{ProviderError, ProviderErrorKind};

/// Token-bucket admission for one provider. Denials surface as retryable
/// `RateLimited` faults so the pipeline backs off instead of hammering.
pub struct ProviderRateLimiter {
    provider: String,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl ProviderRateLimiter {
    pub fn new(provider: impl Into<String>, per_second: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second.max(1)).expect("non-zero"));
        Self {
            provider: provider.into(),
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn try_acquire(&self) -> Result<(), ProviderError> {
        self.limiter.check().map_err(|_| {
            ProviderError::new(
                &self.provider,
                ProviderErrorKind::RateLimited,
                "Local rate limit exceeded",
            )
            .with_code("local_rate_limit")
        })
    }
}
