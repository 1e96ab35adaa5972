use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::shared::domain::errors::AppError;

/// Service configuration, loaded once at startup from the environment.
///
/// Every resilience and cache knob has a default matching the documented
/// behavior; provider credentials have no defaults and simply stay empty when
/// the corresponding variables are absent (the adapter then refuses to start).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub redis_url: String,
    pub resilience: ResilienceConfig,
    pub idempotency: IdempotencyConfig,
    pub status_cache: StatusCacheConfig,
    pub webhooks: WebhookConfig,
    pub providers: HashMap<String, ProviderCredentials>,
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Per-attempt timeout for provider calls.
    pub provider_timeout: Duration,
    /// Maximum attempts per provider call (first try included).
    pub max_attempts: u32,
    /// Base backoff interval; attempt n sleeps rand(0, base * 2^(n-1)).
    pub backoff_base: Duration,
    pub breaker_consecutive_failures: u32,
    pub breaker_failure_ratio: f64,
    pub breaker_min_samples: u32,
    pub breaker_window: Duration,
    pub breaker_open_duration: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            breaker_consecutive_failures: 5,
            breaker_failure_ratio: 0.5,
            breaker_min_samples: 10,
            breaker_window: Duration::from_secs(30),
            breaker_open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub lock_ttl: Duration,
    pub result_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            result_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusCacheConfig {
    pub active_ttl: Duration,
    pub terminal_ttl: Duration,
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self {
            active_ttl: Duration::from_secs(60),
            terminal_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Per-provider ingest limit, events per minute.
    pub rate_limit_per_minute: u32,
    /// Bound of the processor work queue.
    pub queue_capacity: usize,
    pub retention_days: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 100,
            queue_capacity: 1024,
            retention_days: 30,
        }
    }
}

/// Credentials and per-provider overrides as loaded from the environment.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub webhook_secret: String,
    /// PayPal: the webhook id registered with the provider.
    pub webhook_id: String,
    /// Omise: accepted source addresses when no signing secret is configured.
    pub ip_allowlist: Vec<String>,
    pub base_url: Option<String>,
    pub timeout_override: Option<Duration>,
    pub max_attempts_override: Option<u32>,
    /// Token-bucket size; None disables the per-provider rate limiter.
    pub rate_limit_per_second: Option<u32>,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn secs_var(name: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_var(name, default.as_secs()))
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Configuration("DATABASE_URL is required".to_string()))?;
        let redis_url = var_or("REDIS_URL", "redis://127.0.0.1:6379");

        let resilience = ResilienceConfig {
            provider_timeout: secs_var("PROVIDER_TIMEOUT_SECS", Duration::from_secs(30)),
            max_attempts: parse_var("PROVIDER_MAX_ATTEMPTS", 3),
            backoff_base: secs_var("PROVIDER_BACKOFF_BASE_SECS", Duration::from_secs(2)),
            breaker_consecutive_failures: parse_var("BREAKER_CONSECUTIVE_FAILURES", 5),
            breaker_failure_ratio: parse_var("BREAKER_FAILURE_RATIO", 0.5),
            breaker_min_samples: parse_var("BREAKER_MIN_SAMPLES", 10),
            breaker_window: secs_var("BREAKER_WINDOW_SECS", Duration::from_secs(30)),
            breaker_open_duration: secs_var("BREAKER_OPEN_SECS", Duration::from_secs(30)),
        };

        let idempotency = IdempotencyConfig {
            lock_ttl: secs_var("IDEMPOTENCY_LOCK_TTL_SECS", Duration::from_secs(30)),
            result_ttl: secs_var("IDEMPOTENCY_RESULT_TTL_SECS", Duration::from_secs(24 * 3600)),
        };

        let status_cache = StatusCacheConfig {
            active_ttl: secs_var("STATUS_CACHE_ACTIVE_TTL_SECS", Duration::from_secs(60)),
            terminal_ttl: secs_var("STATUS_CACHE_TERMINAL_TTL_SECS", Duration::from_secs(3600)),
        };

        let webhooks = WebhookConfig {
            rate_limit_per_minute: parse_var("WEBHOOK_RATE_LIMIT_PER_MINUTE", 100),
            queue_capacity: parse_var("WEBHOOK_QUEUE_CAPACITY", 1024),
            retention_days: parse_var("WEBHOOK_RETENTION_DAYS", 30),
        };

        let mut providers = HashMap::new();
        providers.insert(
            "stripe".to_string(),
            ProviderCredentials {
                api_key: var_or("STRIPE_API_KEY", ""),
                webhook_secret: var_or("STRIPE_WEBHOOK_SECRET", ""),
                base_url: env::var("STRIPE_BASE_URL").ok(),
                ..Default::default()
            },
        );
        providers.insert(
            "paypal".to_string(),
            ProviderCredentials {
                api_key: var_or("PAYPAL_CLIENT_ID", ""),
                api_secret: var_or("PAYPAL_CLIENT_SECRET", ""),
                webhook_id: var_or("PAYPAL_WEBHOOK_ID", ""),
                base_url: env::var("PAYPAL_BASE_URL").ok(),
                ..Default::default()
            },
        );
        providers.insert(
            "omise".to_string(),
            ProviderCredentials {
                api_key: var_or("OMISE_SECRET_KEY", ""),
                webhook_secret: var_or("OMISE_WEBHOOK_SECRET", ""),
                ip_allowlist: env::var("OMISE_IP_ALLOWLIST")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
                base_url: env::var("OMISE_BASE_URL").ok(),
                ..Default::default()
            },
        );
        providers.insert(
            "scb".to_string(),
            ProviderCredentials {
                api_key: var_or("SCB_API_KEY", ""),
                api_secret: var_or("SCB_API_SECRET", ""),
                webhook_secret: var_or("SCB_WEBHOOK_SECRET", ""),
                base_url: env::var("SCB_BASE_URL").ok(),
                ..Default::default()
            },
        );

        Ok(Self {
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:3007"),
            database_url,
            redis_url,
            resilience,
            idempotency,
            status_cache,
            webhooks,
            providers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resilience_defaults_match_documented_behavior() {
        let config = ResilienceConfig::default();
        assert_eq!(config.provider_timeout, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.breaker_consecutive_failures, 5);
        assert_eq!(config.breaker_open_duration, Duration::from_secs(30));
    }

    #[test]
    fn cache_defaults_split_terminal_and_active() {
        let config = StatusCacheConfig::default();
        assert_eq!(config.active_ttl, Duration::from_secs(60));
        assert_eq!(config.terminal_ttl, Duration::from_secs(3600));
    }
}
