pub mod circuit_breaker;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, CODE_CIRCUIT_OPEN};
pub use pipeline::{LatencyTracker, ProviderPipelineRegistry, ResilientProvider};
pub use rate_limit::ProviderRateLimiter;
pub use retry::RetryPolicy;
