use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::ResilienceConfig;
use crate::bounded_contexts::payment::domain::events::{to_envelope, ProviderHealthEvent};
use crate::shared::domain::errors::{ProviderError, ProviderErrorKind};
use crate::shared::infrastructure::cache::CacheStore;
use crate::shared::infrastructure::event_bus::{EventPublisher, PROVIDER_TOPIC};
use crate::shared::infrastructure::metrics::Metrics;

/// Error code carried by short-circuited calls; the retry policy treats it as
/// terminal.
pub const CODE_CIRCUIT_OPEN: &str = "circuit_open";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub consecutive_failures: u32,
    pub failure_ratio: f64,
    pub min_samples: u32,
    pub window: Duration,
    pub open_duration: Duration,
}

impl From<&ResilienceConfig> for BreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            consecutive_failures: config.breaker_consecutive_failures,
            failure_ratio: config.breaker_failure_ratio,
            min_samples: config.breaker_min_samples,
            window: config.breaker_window,
            open_duration: config.breaker_open_duration,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            failure_ratio: 0.5,
            min_samples: 10,
            window: Duration::from_secs(30),
            open_duration: Duration::from_secs(30),
        }
    }
}

/// State mirrored to the distributed store, keyed by provider name, so every
/// instance sees an Open breaker.
#[derive(Debug, Serialize, Deserialize)]
struct SharedBreakerState {
    state: String,
    since_epoch_ms: i64,
}

struct BreakerInner {
    state: CircuitState,
    changed_at: Instant,
    /// Attempt outcomes within the sliding window; true = success.
    outcomes: VecDeque<(Instant, bool)>,
    consecutive_failures: u32,
    probe_in_flight: bool,
    /// Version of the shared-state entry this instance last wrote or adopted.
    shared_version: u64,
}

enum Transition {
    Opened,
    Recovered,
}

/// One logical breaker per provider name: the pipeline, the router and the
/// orchestrator all consult the same instance.
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: RwLock<BreakerInner>,
    store: Arc<dyn CacheStore>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Metrics,
}

impl CircuitBreaker {
    pub fn new(
        provider: impl Into<String>,
        config: BreakerConfig,
        store: Arc<dyn CacheStore>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Metrics,
    ) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                changed_at: Instant::now(),
                outcomes: VecDeque::new(),
                consecutive_failures: 0,
                probe_in_flight: false,
                shared_version: 0,
            }),
            store,
            publisher,
            metrics,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn shared_key(&self) -> String {
        format!("breaker:{}", self.provider)
    }

    fn open_error(&self) -> ProviderError {
        ProviderError::new(
            &self.provider,
            ProviderErrorKind::ProviderInternal,
            format!("Circuit breaker for {} is open", self.provider),
        )
        .with_code(CODE_CIRCUIT_OPEN)
    }

    /// Adopts a newer shared state written by another instance. Best-effort:
    /// store trouble never blocks the call path.
    async fn refresh_from_store(&self) {
        let shared = match self.store.get_versioned(&self.shared_key()).await {
            Ok(Some((value, version))) => match serde_json::from_str::<SharedBreakerState>(&value) {
                Ok(state) => Some((state, version)),
                Err(e) => {
                    tracing::warn!(provider = %self.provider, error = %e, "corrupt shared breaker state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(provider = %self.provider, error = %e, "breaker state read failed");
                None
            }
        };

        let (shared, version) = match shared {
            Some(pair) => pair,
            None => return,
        };

        let mut inner = self.inner.write();
        if version <= inner.shared_version {
            return;
        }
        inner.shared_version = version;

        match shared.state.as_str() {
            "Open" => {
                let elapsed_ms = (Utc::now().timestamp_millis() - shared.since_epoch_ms).max(0) as u64;
                let elapsed = Duration::from_millis(elapsed_ms);
                if elapsed < self.config.open_duration && inner.state != CircuitState::Open {
                    inner.state = CircuitState::Open;
                    inner.changed_at = Instant::now()
                        .checked_sub(elapsed)
                        .unwrap_or_else(Instant::now);
                    inner.probe_in_flight = false;
                }
            }
            "Closed" => {
                if inner.state != CircuitState::Closed {
                    inner.state = CircuitState::Closed;
                    inner.changed_at = Instant::now();
                    inner.outcomes.clear();
                    inner.consecutive_failures = 0;
                    inner.probe_in_flight = false;
                }
            }
            _ => {}
        }
    }

    async fn sync_to_store(&self, state: CircuitState) {
        let (expected, next) = {
            let mut inner = self.inner.write();
            let expected = inner.shared_version;
            inner.shared_version += 1;
            (expected, inner.shared_version)
        };

        let payload = SharedBreakerState {
            state: state.as_str().to_string(),
            since_epoch_ms: Utc::now().timestamp_millis(),
        };
        let value = match serde_json::to_string(&payload) {
            Ok(v) => v,
            Err(_) => return,
        };

        match self
            .store
            .compare_and_swap(&self.shared_key(), expected, &value, next)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                // Another instance moved first; adopt its view.
                self.refresh_from_store().await;
            }
            Err(e) => {
                tracing::debug!(provider = %self.provider, error = %e, "breaker state write failed");
            }
        }
    }

    /// Admission check for one attempt. An Open breaker short-circuits; a
    /// HalfOpen breaker admits exactly one probe.
    pub async fn check(&self) -> Result<(), ProviderError> {
        self.refresh_from_store().await;

        let mut inner = self.inner.write();

        if inner.state == CircuitState::Open && inner.changed_at.elapsed() >= self.config.open_duration
        {
            inner.state = CircuitState::HalfOpen;
            inner.changed_at = Instant::now();
            inner.probe_in_flight = false;
            self.metrics
                .breaker_transitions
                .with_label_values(&[self.provider.as_str(), "HalfOpen"])
                .inc();
        }

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(self.open_error()),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records one attempt outcome and applies the trip rules: within the
    /// sliding window, >= N consecutive failures or failure ratio >= R with
    /// enough samples opens the circuit.
    pub async fn record(&self, success: bool) {
        let transition = {
            let mut inner = self.inner.write();
            let now = Instant::now();

            inner.outcomes.push_back((now, success));
            let cutoff = now - self.config.window;
            while matches!(inner.outcomes.front(), Some((t, _)) if *t < cutoff) {
                inner.outcomes.pop_front();
            }

            if success {
                inner.consecutive_failures = 0;
            } else {
                inner.consecutive_failures += 1;
            }

            match inner.state {
                CircuitState::Closed => {
                    if !success && self.should_trip(&inner) {
                        inner.state = CircuitState::Open;
                        inner.changed_at = now;
                        Some(Transition::Opened)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.probe_in_flight = false;
                    if success {
                        inner.state = CircuitState::Closed;
                        inner.changed_at = now;
                        inner.outcomes.clear();
                        inner.consecutive_failures = 0;
                        Some(Transition::Recovered)
                    } else {
                        inner.state = CircuitState::Open;
                        inner.changed_at = now;
                        Some(Transition::Opened)
                    }
                }
                CircuitState::Open => None,
            }
        };

        match transition {
            Some(Transition::Opened) => {
                tracing::warn!(provider = %self.provider, "circuit breaker opened");
                self.metrics
                    .breaker_transitions
                    .with_label_values(&[self.provider.as_str(), "Open"])
                    .inc();
                self.sync_to_store(CircuitState::Open).await;
                let event = ProviderHealthEvent::degraded(
                    &self.provider,
                    CircuitState::Open.as_str(),
                    "failure threshold exceeded",
                );
                if let Err(e) = self.publisher.publish(PROVIDER_TOPIC, &to_envelope(&event)).await {
                    tracing::warn!(provider = %self.provider, error = %e, "failed to publish degraded event");
                }
            }
            Some(Transition::Recovered) => {
                tracing::info!(provider = %self.provider, "circuit breaker closed");
                self.metrics
                    .breaker_transitions
                    .with_label_values(&[self.provider.as_str(), "Closed"])
                    .inc();
                self.sync_to_store(CircuitState::Closed).await;
                let event = ProviderHealthEvent::recovered(
                    &self.provider,
                    CircuitState::Closed.as_str(),
                    "probe succeeded",
                );
                if let Err(e) = self.publisher.publish(PROVIDER_TOPIC, &to_envelope(&event)).await {
                    tracing::warn!(provider = %self.provider, error = %e, "failed to publish recovered event");
                }
            }
            None => {}
        }
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        if inner.consecutive_failures >= self.config.consecutive_failures {
            return true;
        }
        let samples = inner.outcomes.len() as u32;
        if samples >= self.config.min_samples {
            let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count() as f64;
            if failures / samples as f64 >= self.config.failure_ratio {
                return true;
            }
        }
        false
    }

    /// Current state, refreshed from the shared store. The routing layer
    /// treats HalfOpen as routable (it admits the probe).
    pub async fn current_state(&self) -> CircuitState {
        self.refresh_from_store().await;
        let mut inner = self.inner.write();
        if inner.state == CircuitState::Open && inner.changed_at.elapsed() >= self.config.open_duration
        {
            inner.state = CircuitState::HalfOpen;
            inner.changed_at = Instant::now();
            inner.probe_in_flight = false;
        }
        inner.state
    }

    pub async fn is_open(&self) -> bool {
        self.current_state().await == CircuitState::Open
    }
}

/// Breakers keyed by provider name.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
    store: Arc<dyn CacheStore>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Metrics,
}

impl CircuitBreakerRegistry {
    pub fn new(
        config: BreakerConfig,
        store: Arc<dyn CacheStore>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Metrics,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            store,
            publisher,
            metrics,
        }
    }

    pub fn get_or_create(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider,
                    self.config.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.publisher),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::infrastructure::cache::InMemoryCacheStore;
    use crate::shared::infrastructure::event_bus::InMemoryEventPublisher;

    fn breaker_with(config: BreakerConfig) -> (CircuitBreaker, Arc<InMemoryEventPublisher>) {
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let breaker = CircuitBreaker::new(
            "stripe",
            config,
            Arc::new(InMemoryCacheStore::new()),
            publisher.clone(),
            Metrics::unregistered(),
        );
        (breaker, publisher)
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            consecutive_failures: 5,
            failure_ratio: 0.5,
            min_samples: 10,
            window: Duration::from_secs(30),
            open_duration: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn five_consecutive_failures_open_the_circuit() {
        let (breaker, publisher) = breaker_with(fast_config());

        for _ in 0..4 {
            breaker.check().await.unwrap();
            breaker.record(false).await;
        }
        assert_eq!(breaker.current_state().await, CircuitState::Closed);

        breaker.check().await.unwrap();
        breaker.record(false).await;
        assert!(breaker.is_open().await);

        let denied = breaker.check().await.unwrap_err();
        assert_eq!(denied.code.as_deref(), Some(CODE_CIRCUIT_OPEN));

        assert_eq!(publisher.events_of_type("provider.degraded").len(), 1);
    }

    #[tokio::test]
    async fn success_resets_the_consecutive_counter() {
        let (breaker, _) = breaker_with(fast_config());

        for _ in 0..4 {
            breaker.record(false).await;
        }
        breaker.record(true).await;
        for _ in 0..4 {
            breaker.record(false).await;
        }

        assert_eq!(breaker.current_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failure_ratio_trips_with_enough_samples() {
        let mut config = fast_config();
        config.consecutive_failures = 100; // isolate the ratio rule
        let (breaker, _) = breaker_with(config);

        // 10 samples, alternating: 5 failures / 10 = 0.5
        for i in 0..10 {
            breaker.record(i % 2 == 0).await;
        }

        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn half_open_admits_one_probe_then_closes_on_success() {
        let (breaker, publisher) = breaker_with(fast_config());

        for _ in 0..5 {
            breaker.record(false).await;
        }
        assert!(breaker.is_open().await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(breaker.current_state().await, CircuitState::HalfOpen);

        // Exactly one probe
        breaker.check().await.unwrap();
        assert!(breaker.check().await.is_err());

        breaker.record(true).await;
        assert_eq!(breaker.current_state().await, CircuitState::Closed);
        assert_eq!(publisher.events_of_type("provider.recovered").len(), 1);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let (breaker, _) = breaker_with(fast_config());

        for _ in 0..5 {
            breaker.record(false).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;

        breaker.check().await.unwrap();
        breaker.record(false).await;

        assert!(breaker.is_open().await);
    }

    #[tokio::test]
    async fn open_state_is_shared_through_the_store() {
        let store: Arc<InMemoryCacheStore> = Arc::new(InMemoryCacheStore::new());
        let publisher = Arc::new(InMemoryEventPublisher::new());

        let breaker_a = CircuitBreaker::new(
            "stripe",
            fast_config(),
            store.clone() as Arc<dyn CacheStore>,
            publisher.clone(),
            Metrics::unregistered(),
        );
        let breaker_b = CircuitBreaker::new(
            "stripe",
            fast_config(),
            store as Arc<dyn CacheStore>,
            publisher,
            Metrics::unregistered(),
        );

        for _ in 0..5 {
            breaker_a.record(false).await;
        }
        assert!(breaker_a.is_open().await);

        // The second instance adopts the shared Open state
        assert!(breaker_b.is_open().await);
    }
}
