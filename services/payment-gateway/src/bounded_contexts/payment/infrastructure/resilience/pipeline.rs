use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::shared::domain::errors::{ProviderError, ProviderErrorKind};
use crate::shared::infrastructure::metrics::Metrics;

use crate::bounded_contexts::payment::infrastructure::providers::{
    ChargeOutcome, ChargeRequest, ProviderAdapter, RefundCallRequest, RefundOutcome, StatusOutcome,
};

use super::{CircuitBreaker, ProviderRateLimiter, RetryPolicy};

const LATENCY_SAMPLES: usize = 32;

/// Rolling average of recent successful call latencies per provider; the
/// router uses it as a tie-breaker.
#[derive(Default)]
pub struct LatencyTracker {
    samples: DashMap<String, Mutex<VecDeque<u64>>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, provider: &str, latency: Duration) {
        let entry = self
            .samples
            .entry(provider.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(LATENCY_SAMPLES)));
        let mut window = entry.lock();
        if window.len() == LATENCY_SAMPLES {
            window.pop_front();
        }
        window.push_back(latency.as_millis() as u64);
    }

    pub fn average_ms(&self, provider: &str) -> Option<u64> {
        let entry = self.samples.get(provider)?;
        let window = entry.lock();
        if window.is_empty() {
            return None;
        }
        Some(window.iter().sum::<u64>() / window.len() as u64)
    }
}

/// One provider adapter wrapped in the full resilience stack, outermost to
/// innermost: per-attempt timeout, retry with backoff, circuit breaker,
/// token-bucket limiter. The breaker observes individual attempt outcomes.
pub struct ResilientProvider {
    adapter: Arc<dyn ProviderAdapter>,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<ProviderRateLimiter>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    latency: Arc<LatencyTracker>,
    metrics: Metrics,
}

impl ResilientProvider {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        breaker: Arc<CircuitBreaker>,
        limiter: Option<ProviderRateLimiter>,
        retry: RetryPolicy,
        attempt_timeout: Duration,
        latency: Arc<LatencyTracker>,
        metrics: Metrics,
    ) -> Self {
        Self {
            adapter,
            breaker,
            limiter,
            retry,
            attempt_timeout,
            latency,
            metrics,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }

    pub async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        self.run("charge", || self.adapter.process_payment(request))
            .await
    }

    pub async fn refund(&self, request: &RefundCallRequest) -> Result<RefundOutcome, ProviderError> {
        self.run("refund", || self.adapter.process_refund(request))
            .await
    }

    pub async fn fetch_status(
        &self,
        provider_transaction_id: &str,
    ) -> Result<StatusOutcome, ProviderError> {
        self.run("status", || self.adapter.get_status(provider_transaction_id))
            .await
    }

    async fn run<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let provider = self.adapter.name().to_string();
        let mut attempt: u32 = 1;

        loop {
            self.breaker.check().await?;

            if let Some(limiter) = &self.limiter {
                if let Err(denied) = limiter.try_acquire() {
                    // Local admission, not a provider outcome: backoff without
                    // feeding the breaker.
                    if !self.retry.should_retry(&denied, attempt) {
                        return Err(denied);
                    }
                    tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    attempt += 1;
                    continue;
                }
            }

            let started = Instant::now();
            let error = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(Ok(value)) => {
                    let elapsed = started.elapsed();
                    self.breaker.record(true).await;
                    self.latency.record(&provider, elapsed);
                    self.metrics
                        .provider_calls
                        .with_label_values(&[provider.as_str(), operation, "success"])
                        .inc();
                    self.metrics
                        .provider_latency
                        .with_label_values(&[provider.as_str(), operation])
                        .observe(elapsed.as_secs_f64());
                    return Ok(value);
                }
                Ok(Err(error)) => error,
                Err(_) => ProviderError::new(
                    &provider,
                    ProviderErrorKind::Timeout,
                    format!("Attempt timed out after {:?}", self.attempt_timeout),
                ),
            };

            self.breaker.record(false).await;
            self.metrics
                .provider_calls
                .with_label_values(&[provider.as_str(), operation, "failure"])
                .inc();
            tracing::warn!(
                provider = %provider,
                operation,
                attempt,
                error = %error,
                "provider call attempt failed"
            );

            if !self.retry.should_retry(&error, attempt) {
                return Err(error);
            }
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
            attempt += 1;
        }
    }
}

/// Resilient pipelines keyed by provider name, built once at startup.
#[derive(Default)]
pub struct ProviderPipelineRegistry {
    pipelines: HashMap<String, Arc<ResilientProvider>>,
}

impl ProviderPipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pipeline: Arc<ResilientProvider>) {
        self.pipelines
            .insert(pipeline.provider_name().to_string(), pipeline);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<ResilientProvider>> {
        self.pipelines.get(provider).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::bounded_contexts::payment::infrastructure::providers::{
        RemoteStatus, WebhookHeaders,
    };
    use crate::bounded_contexts::payment::infrastructure::resilience::circuit_breaker::BreakerConfig;
    use crate::shared::domain::errors::AppError;
    use crate::shared::infrastructure::cache::InMemoryCacheStore;
    use crate::shared::infrastructure::event_bus::InMemoryEventPublisher;

    /// Fails a configurable number of times before succeeding.
    struct FlakyAdapter {
        calls: AtomicU32,
        failures_before_success: u32,
        kind: ProviderErrorKind,
    }

    impl FlakyAdapter {
        fn new(failures_before_success: u32, kind: ProviderErrorKind) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures_before_success,
                kind,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn process_payment(
            &self,
            _request: &ChargeRequest,
        ) -> Result<ChargeOutcome, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(ProviderError::new("flaky", self.kind, "synthetic failure"))
            } else {
                Ok(ChargeOutcome {
                    provider_transaction_id: "tx_1".to_string(),
                    payment_url: None,
                    completed: false,
                    raw_response: Value::Null,
                })
            }
        }

        async fn get_status(&self, _id: &str) -> Result<StatusOutcome, ProviderError> {
            Ok(StatusOutcome {
                status: RemoteStatus::Processing,
                raw_response: Value::Null,
            })
        }

        async fn process_refund(
            &self,
            _request: &RefundCallRequest,
        ) -> Result<RefundOutcome, ProviderError> {
            Err(ProviderError::new("flaky", self.kind, "synthetic failure"))
        }

        async fn validate_webhook(
            &self,
            _payload: &str,
            _headers: &WebhookHeaders,
            _ip: Option<&str>,
        ) -> Result<bool, AppError> {
            Ok(true)
        }

        fn extract_event_id(&self, payload: &Value) -> Option<String> {
            payload.get("id").and_then(|v| v.as_str()).map(String::from)
        }
    }

    fn pipeline_around(adapter: Arc<FlakyAdapter>) -> ResilientProvider {
        let breaker = Arc::new(CircuitBreaker::new(
            "flaky",
            BreakerConfig::default(),
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemoryEventPublisher::new()),
            Metrics::unregistered(),
        ));
        ResilientProvider::new(
            adapter,
            breaker,
            None,
            RetryPolicy::new(3, Duration::from_millis(1)),
            Duration::from_secs(5),
            Arc::new(LatencyTracker::new()),
            Metrics::unregistered(),
        )
    }

    fn charge_request() -> ChargeRequest {
        ChargeRequest {
            transaction_id: uuid::Uuid::new_v4(),
            amount: rust_decimal::Decimal::new(9999, 2),
            currency: "USD".to_string(),
            customer_id: "c1".to_string(),
            order_id: "o1".to_string(),
            description: None,
            return_url: None,
            cancel_url: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let adapter = Arc::new(FlakyAdapter::new(2, ProviderErrorKind::Network));
        let pipeline = pipeline_around(adapter.clone());

        let outcome = pipeline.charge(&charge_request()).await.unwrap();
        assert_eq!(outcome.provider_transaction_id, "tx_1");
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn non_retryable_failures_stop_after_one_attempt() {
        let adapter = Arc::new(FlakyAdapter::new(10, ProviderErrorKind::InvalidRequest));
        let pipeline = pipeline_around(adapter.clone());

        let error = pipeline.charge(&charge_request()).await.unwrap_err();
        assert_eq!(error.kind, ProviderErrorKind::InvalidRequest);
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_exhausted_after_max_attempts() {
        let adapter = Arc::new(FlakyAdapter::new(10, ProviderErrorKind::Timeout));
        let pipeline = pipeline_around(adapter.clone());

        let error = pipeline.charge(&charge_request()).await.unwrap_err();
        assert_eq!(error.kind, ProviderErrorKind::Timeout);
        assert_eq!(adapter.calls(), 3);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_the_adapter() {
        let adapter = Arc::new(FlakyAdapter::new(0, ProviderErrorKind::Network));
        let breaker = Arc::new(CircuitBreaker::new(
            "flaky",
            BreakerConfig::default(),
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemoryEventPublisher::new()),
            Metrics::unregistered(),
        ));
        for _ in 0..5 {
            breaker.record(false).await;
        }

        let pipeline = ResilientProvider::new(
            adapter.clone(),
            breaker,
            None,
            RetryPolicy::new(3, Duration::from_millis(1)),
            Duration::from_secs(5),
            Arc::new(LatencyTracker::new()),
            Metrics::unregistered(),
        );

        let error = pipeline.charge(&charge_request()).await.unwrap_err();
        assert_eq!(error.code.as_deref(), Some(super::super::CODE_CIRCUIT_OPEN));
        assert_eq!(adapter.calls(), 0, "no provider call may happen while open");
    }

    #[test]
    fn latency_average_is_windowed() {
        let tracker = LatencyTracker::new();
        assert_eq!(tracker.average_ms("stripe"), None);

        tracker.record("stripe", Duration::from_millis(100));
        tracker.record("stripe", Duration::from_millis(300));
        assert_eq!(tracker.average_ms("stripe"), Some(200));
    }
}
