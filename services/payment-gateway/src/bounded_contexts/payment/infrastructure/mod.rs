pub mod idempotency;
pub mod providers;
pub mod repositories;
pub mod resilience;
pub mod status_cache;
pub mod webhooks;
