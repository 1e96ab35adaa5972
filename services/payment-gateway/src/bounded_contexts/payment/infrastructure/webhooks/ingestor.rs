use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::shared::domain::errors::AppError;
use crate::shared::infrastructure::cache::CacheStore;
use crate::shared::infrastructure::metrics::Metrics;

use crate::bounded_contexts::payment::application::dto::WebhookAck;
use crate::bounded_contexts::payment::domain::entities::WebhookEvent;
use crate::bounded_contexts::payment::domain::repository::{
    ProviderRepository, WebhookEventRepository, WebhookInsertOutcome,
};
use crate::bounded_contexts::payment::infrastructure::providers::{
    AdapterRegistry, WebhookHeaders,
};

use super::WebhookQueueSender;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Receives raw provider notifications: resolves the provider, rate-limits,
/// validates the signature through the adapter, deduplicates on
/// `(provider_id, provider_event_id)`, persists the event and hands the id to
/// the processor queue. The HTTP acknowledgement only waits for the insert.
pub struct WebhookIngestor {
    providers: Arc<dyn ProviderRepository>,
    adapters: AdapterRegistry,
    events: Arc<dyn WebhookEventRepository>,
    cache: Arc<dyn CacheStore>,
    queue: WebhookQueueSender,
    metrics: Metrics,
    rate_limit_per_minute: u32,
}

impl WebhookIngestor {
    pub fn new(
        providers: Arc<dyn ProviderRepository>,
        adapters: AdapterRegistry,
        events: Arc<dyn WebhookEventRepository>,
        cache: Arc<dyn CacheStore>,
        queue: WebhookQueueSender,
        metrics: Metrics,
        rate_limit_per_minute: u32,
    ) -> Self {
        Self {
            providers,
            adapters,
            events,
            cache,
            queue,
            metrics,
            rate_limit_per_minute,
        }
    }

    pub async fn ingest(
        &self,
        provider_name: &str,
        raw_payload: &str,
        headers: &WebhookHeaders,
        source_ip: Option<&str>,
    ) -> Result<WebhookAck, AppError> {
        let provider = self
            .providers
            .find_by_name(provider_name)
            .await?
            .ok_or_else(|| AppError::UnknownProvider(format!("Unknown provider '{}'", provider_name)))?;
        let adapter = self.adapters.get(&provider.name).ok_or_else(|| {
            AppError::UnknownProvider(format!("No adapter configured for '{}'", provider.name))
        })?;

        let rate_key = format!("webhook:rate:{}", provider.name);
        let count = self.cache.increment_window(&rate_key, RATE_WINDOW).await?;
        if count > self.rate_limit_per_minute as u64 {
            self.metrics
                .webhook_events_received
                .with_label_values(&[provider.name.as_str(), "rate_limited"])
                .inc();
            return Err(AppError::RateLimited(format!(
                "Provider {} exceeded {} webhooks per minute",
                provider.name, self.rate_limit_per_minute
            )));
        }

        let valid = adapter
            .validate_webhook(raw_payload, headers, source_ip)
            .await?;
        if !valid {
            self.metrics
                .webhook_signature_failures
                .with_label_values(&[provider.name.as_str()])
                .inc();
            self.metrics
                .webhook_events_received
                .with_label_values(&[provider.name.as_str(), "invalid_signature"])
                .inc();
            tracing::warn!(provider = %provider.name, source_ip, "webhook signature rejected");
            return Err(AppError::InvalidSignature(format!(
                "Signature validation failed for provider {}",
                provider.name
            )));
        }

        let payload: serde_json::Value = serde_json::from_str(raw_payload)
            .map_err(|e| AppError::Validation(format!("Webhook payload is not JSON: {}", e)))?;

        let provider_event_id = adapter.extract_event_id(&payload).ok_or_else(|| {
            AppError::MissingEventId(format!(
                "Webhook from {} carried no event id",
                provider.name
            ))
        })?;

        // Idempotent replay: surface the first ingestion's id.
        if let Some(existing) = self
            .events
            .find_by_provider_event(provider.id, &provider_event_id)
            .await?
        {
            self.metrics
                .webhook_events_received
                .with_label_values(&[provider.name.as_str(), "duplicate"])
                .inc();
            return Ok(WebhookAck {
                event_id: existing.id,
                accepted: true,
                duplicate: true,
            });
        }

        let event_type = payload
            .get("type")
            .or_else(|| payload.get("event_type"))
            .or_else(|| payload.get("key"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let signature = headers
            .get("Stripe-Signature")
            .or_else(|| headers.get("PAYPAL-TRANSMISSION-SIG"))
            .or_else(|| headers.get("X-Omise-Signature"))
            .or_else(|| headers.get("X-SCB-Signature"))
            .map(|s| s.to_string());

        let mut event = WebhookEvent::receive(
            provider.id,
            provider_event_id,
            event_type,
            raw_payload.to_string(),
            signature,
            source_ip.map(|ip| ip.to_string()),
        );
        event.parsed_payload = Some(payload);

        match self.events.insert(&event).await? {
            WebhookInsertOutcome::Inserted => {}
            WebhookInsertOutcome::Duplicate { existing_id } => {
                // Insert race: the unique constraint decided.
                self.metrics
                    .webhook_events_received
                    .with_label_values(&[provider.name.as_str(), "duplicate"])
                    .inc();
                return Ok(WebhookAck {
                    event_id: existing_id,
                    accepted: true,
                    duplicate: true,
                });
            }
        }

        self.metrics
            .webhook_events_received
            .with_label_values(&[provider.name.as_str(), "accepted"])
            .inc();

        if !self.queue.try_enqueue(event.id) {
            // Backpressure: leave the row for the retry scanner.
            tracing::warn!(event_id = %event.id, "webhook queue full, deferring to retry scan");
            event.fail_processing(
                "processor queue full".to_string(),
                Some(Utc::now() + chrono::Duration::minutes(1)),
            );
            if let Err(e) = self.events.update(&event).await {
                tracing::error!(event_id = %event.id, error = %e, "failed to defer webhook event");
            }
        }

        Ok(WebhookAck {
            event_id: event.id,
            accepted: true,
            duplicate: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use uuid::Uuid;

    use crate::bounded_contexts::payment::domain::entities::PaymentProvider;
    use crate::bounded_contexts::payment::domain::value_objects::ProviderStatus;
    use crate::bounded_contexts::payment::infrastructure::providers::{
        ChargeOutcome, ChargeRequest, ProviderAdapter, RefundCallRequest, RefundOutcome,
        RemoteStatus, StatusOutcome,
    };
    use crate::bounded_contexts::payment::infrastructure::repositories::{
        InMemoryProviderRepository, InMemoryWebhookEventRepository,
    };
    use crate::bounded_contexts::payment::infrastructure::webhooks::webhook_queue;
    use crate::shared::domain::errors::ProviderError;
    use crate::shared::infrastructure::cache::InMemoryCacheStore;

    /// Accepts exactly the signature "good".
    struct FixedSignatureAdapter;

    #[async_trait]
    impl ProviderAdapter for FixedSignatureAdapter {
        fn name(&self) -> &str {
            "stripe"
        }

        async fn process_payment(&self, _r: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
            unreachable!()
        }

        async fn get_status(&self, _id: &str) -> Result<StatusOutcome, ProviderError> {
            Ok(StatusOutcome {
                status: RemoteStatus::Processing,
                raw_response: Value::Null,
            })
        }

        async fn process_refund(
            &self,
            _r: &RefundCallRequest,
        ) -> Result<RefundOutcome, ProviderError> {
            unreachable!()
        }

        async fn validate_webhook(
            &self,
            _payload: &str,
            headers: &WebhookHeaders,
            _ip: Option<&str>,
        ) -> Result<bool, AppError> {
            Ok(headers.get("Stripe-Signature") == Some("good"))
        }

        fn extract_event_id(&self, payload: &Value) -> Option<String> {
            payload
                .get("id")
                .and_then(|v| v.as_str())
                .map(String::from)
        }
    }

    struct Harness {
        ingestor: WebhookIngestor,
        events: Arc<InMemoryWebhookEventRepository>,
        rx: tokio::sync::mpsc::Receiver<Uuid>,
    }

    fn harness(rate_limit: u32) -> Harness {
        let provider = PaymentProvider {
            id: Uuid::new_v4(),
            name: "stripe".to_string(),
            display_name: "Stripe".to_string(),
            status: ProviderStatus::Active,
            supported_currencies: vec!["USD".to_string()],
            priority: 1,
            credentials: HashMap::new(),
            configurations: serde_json::json!([]),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            deleted_at: None,
        };
        let providers = Arc::new(InMemoryProviderRepository::new(vec![provider]));

        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(FixedSignatureAdapter));

        let events = Arc::new(InMemoryWebhookEventRepository::new());
        let (sender, rx) = webhook_queue(16);

        Harness {
            ingestor: WebhookIngestor::new(
                providers,
                adapters,
                events.clone(),
                Arc::new(InMemoryCacheStore::new()),
                sender,
                Metrics::unregistered(),
                rate_limit,
            ),
            events,
            rx,
        }
    }

    fn good_headers() -> WebhookHeaders {
        WebhookHeaders::from([("Stripe-Signature", "good")])
    }

    #[tokio::test]
    async fn valid_webhook_is_persisted_and_enqueued() {
        let mut h = harness(100);

        let ack = h
            .ingestor
            .ingest("stripe", r#"{"id":"evt_1","type":"payment_intent.succeeded"}"#, &good_headers(), None)
            .await
            .unwrap();

        assert!(ack.accepted);
        assert!(!ack.duplicate);
        assert_eq!(h.rx.recv().await, Some(ack.event_id));

        let stored = h.events.find_by_id(ack.event_id).await.unwrap().unwrap();
        assert_eq!(stored.event_type, "payment_intent.succeeded");
    }

    #[tokio::test]
    async fn duplicate_delivery_returns_the_first_event_id() {
        let h = harness(100);
        let payload = r#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;

        let first = h
            .ingestor
            .ingest("stripe", payload, &good_headers(), None)
            .await
            .unwrap();
        let second = h
            .ingestor
            .ingest("stripe", payload, &good_headers(), None)
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(second.event_id, first.event_id);
    }

    #[tokio::test]
    async fn bad_signature_leaves_no_row() {
        let h = harness(100);
        let headers = WebhookHeaders::from([("Stripe-Signature", "tampered")]);

        let error = h
            .ingestor
            .ingest("stripe", r#"{"id":"evt_1"}"#, &headers, None)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::InvalidSignature(_)));

        let provider_id = h
            .ingestor
            .providers
            .find_by_name("stripe")
            .await
            .unwrap()
            .unwrap()
            .id;
        assert!(h
            .events
            .find_by_provider_event(provider_id, "evt_1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let h = harness(100);
        let error = h
            .ingestor
            .ingest("adyen", "{}", &good_headers(), None)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn missing_event_id_is_rejected() {
        let h = harness(100);
        let error = h
            .ingestor
            .ingest("stripe", r#"{"type":"payment_intent.succeeded"}"#, &good_headers(), None)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::MissingEventId(_)));
    }

    #[tokio::test]
    async fn ingest_rate_is_limited_per_provider() {
        let h = harness(2);
        let headers = good_headers();

        for i in 0..2 {
            let payload = format!(r#"{{"id":"evt_{}","type":"x"}}"#, i);
            h.ingestor
                .ingest("stripe", &payload, &headers, None)
                .await
                .unwrap();
        }

        let error = h
            .ingestor
            .ingest("stripe", r#"{"id":"evt_9","type":"x"}"#, &headers, None)
            .await
            .unwrap_err();
        assert!(matches!(error, AppError::RateLimited(_)));
    }
}
