use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::shared::domain::errors::AppError;

/// Counters and histograms the core increments. The registry is injectable;
/// exposing it over HTTP is a deployment concern, not handled here.
#[derive(Clone)]
pub struct Metrics {
    pub provider_calls: IntCounterVec,
    pub provider_latency: HistogramVec,
    pub breaker_transitions: IntCounterVec,
    pub webhook_events_received: IntCounterVec,
    pub webhook_signature_failures: IntCounterVec,
    pub status_cache_lookups: IntCounterVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, AppError> {
        let provider_calls = IntCounterVec::new(
            Opts::new("provider_calls_total", "Provider call outcomes"),
            &["provider", "operation", "outcome"],
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;

        let provider_latency = HistogramVec::new(
            HistogramOpts::new("provider_call_seconds", "Provider call latency"),
            &["provider", "operation"],
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;

        let breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Breaker state transitions"),
            &["provider", "to_state"],
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;

        let webhook_events_received = IntCounterVec::new(
            Opts::new("webhook_events_received_total", "Webhook ingest outcomes"),
            &["provider", "outcome"],
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;

        let webhook_signature_failures = IntCounterVec::new(
            Opts::new("webhook_signature_failures_total", "Rejected webhook signatures"),
            &["provider"],
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;

        let status_cache_lookups = IntCounterVec::new(
            Opts::new("status_cache_lookups_total", "Status cache hits and misses"),
            &["tier", "outcome"],
        )
        .map_err(|e| AppError::Internal(e.to_string()))?;

        for collector in [
            Box::new(provider_calls.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(provider_latency.clone()),
            Box::new(breaker_transitions.clone()),
            Box::new(webhook_events_received.clone()),
            Box::new(webhook_signature_failures.clone()),
            Box::new(status_cache_lookups.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| AppError::Internal(e.to_string()))?;
        }

        Ok(Self {
            provider_calls,
            provider_latency,
            breaker_transitions,
            webhook_events_received,
            webhook_signature_failures,
            status_cache_lookups,
        })
    }

    /// Unregistered instance for tests and defaults.
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).expect("metric construction cannot fail on a fresh registry")
    }
}
