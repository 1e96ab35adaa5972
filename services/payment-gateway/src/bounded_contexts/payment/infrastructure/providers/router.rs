use std::sync::Arc;

pub use crate::bounded_contexts::payment::infrastructure::resilience::LatencyTracker;

use crate::bounded_contexts::payment::domain::entities::PaymentProvider;
use crate::bounded_contexts::payment::domain::repository::ProviderRepository;
use crate::bounded_contexts::payment::domain::value_objects::Currency;
use crate::bounded_contexts::payment::infrastructure::resilience::CircuitBreakerRegistry;
use crate::shared::domain::errors::AppError;

/// Selects a provider for a charge: currency support, caller preference,
/// breaker state, configured priority, observed latency as the tie-breaker,
/// and a Degraded fallback before giving up.
pub struct ProviderRouter {
    providers: Arc<dyn ProviderRepository>,
    breakers: Arc<CircuitBreakerRegistry>,
    latency: Arc<LatencyTracker>,
}

impl ProviderRouter {
    pub fn new(
        providers: Arc<dyn ProviderRepository>,
        breakers: Arc<CircuitBreakerRegistry>,
        latency: Arc<LatencyTracker>,
    ) -> Self {
        Self {
            providers,
            breakers,
            latency,
        }
    }

    pub async fn select(
        &self,
        currency: &Currency,
        preferred: Option<&str>,
    ) -> Result<PaymentProvider, AppError> {
        let candidates = self.providers.find_routable_for_currency(currency).await?;
        if candidates.is_empty() {
            return Err(AppError::NoProviderAvailable(format!(
                "No provider supports currency {}",
                currency
            )));
        }

        // Explicit preference wins when the provider is Active and not
        // short-circuited.
        if let Some(name) = preferred {
            if let Some(provider) = candidates
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(name) && p.is_active())
            {
                if !self.breakers.get_or_create(&provider.name).is_open().await {
                    tracing::debug!(provider = %provider.name, "routing to preferred provider");
                    return Ok(provider.clone());
                }
                tracing::warn!(
                    provider = %provider.name,
                    "preferred provider short-circuited, falling back to ranking"
                );
            }
        }

        let mut active = Vec::new();
        let mut degraded = Vec::new();
        for provider in candidates {
            let open = self.breakers.get_or_create(&provider.name).is_open().await;
            if provider.is_active() && !open {
                active.push(provider);
            } else if !open {
                degraded.push(provider);
            }
        }

        let rank = |p: &PaymentProvider| {
            (
                p.priority,
                self.latency.average_ms(&p.name).unwrap_or(u64::MAX),
            )
        };

        active.sort_by_key(&rank);
        if let Some(provider) = active.into_iter().next() {
            tracing::debug!(provider = %provider.name, "routed by priority");
            return Ok(provider);
        }

        // Last resort: a Degraded provider whose breaker still admits calls.
        degraded.sort_by_key(&rank);
        if let Some(provider) = degraded.into_iter().next() {
            tracing::warn!(provider = %provider.name, "routing to degraded provider");
            return Ok(provider);
        }

        Err(AppError::NoProviderAvailable(format!(
            "All providers for {} are unavailable",
            currency
        )))
    }
}
