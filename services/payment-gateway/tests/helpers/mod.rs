//! Shared harness for the integration suites: in-memory repositories, cache
//! and bus, mock charge adapters behind the real resilience pipeline, and a
//! real Stripe adapter on the webhook path so signature validation is
//! exercised end to end.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::Value;
use uuid::Uuid;

use paygrid_types::CorrelationId;

use payment_gateway::bounded_contexts::payment::application::dto::SubmitPaymentRequest;
use payment_gateway::bounded_contexts::payment::application::orchestrator::PaymentOrchestrator;
use payment_gateway::bounded_contexts::payment::application::refunds::RefundOrchestrator;
use payment_gateway::bounded_contexts::payment::application::status::StatusReadService;
use payment_gateway::bounded_contexts::payment::domain::entities::{
    PaymentProvider, PaymentTransaction, TransactionLog,
};
use payment_gateway::bounded_contexts::payment::domain::repository::PaymentTransactionRepository;
use payment_gateway::bounded_contexts::payment::domain::value_objects::{
    Amount, Currency, IdempotencyKey, PaymentStatus, ProviderStatus,
};
use payment_gateway::bounded_contexts::payment::infrastructure::idempotency::IdempotencyStore;
use payment_gateway::bounded_contexts::payment::infrastructure::providers::{
    AdapterRegistry, ChargeOutcome, ChargeRequest, ProviderAdapter, ProviderRouter,
    RefundCallRequest, RefundOutcome, RemoteStatus, StatusOutcome, StripeAdapter, WebhookHeaders,
};
use payment_gateway::bounded_contexts::payment::infrastructure::repositories::{
    InMemoryPaymentRepository, InMemoryProviderRepository, InMemoryRefundRepository,
    InMemoryWebhookEventRepository,
};
use payment_gateway::bounded_contexts::payment::infrastructure::resilience::circuit_breaker::BreakerConfig;
use payment_gateway::bounded_contexts::payment::infrastructure::resilience::{
    CircuitBreakerRegistry, LatencyTracker, ProviderPipelineRegistry, ResilientProvider,
    RetryPolicy,
};
use payment_gateway::bounded_contexts::payment::infrastructure::status_cache::PaymentStatusCache;
use payment_gateway::bounded_contexts::payment::infrastructure::webhooks::{
    webhook_queue, WebhookIngestor, WebhookProcessor,
};
use payment_gateway::config::{IdempotencyConfig, StatusCacheConfig};
use payment_gateway::shared::domain::errors::{AppError, ProviderError, ProviderErrorKind};
use payment_gateway::shared::infrastructure::cache::InMemoryCacheStore;
use payment_gateway::shared::infrastructure::event_bus::InMemoryEventPublisher;
use payment_gateway::shared::infrastructure::metrics::Metrics;

pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test_secret";

#[derive(Clone, Copy)]
pub enum MockMode {
    Succeed,
    Fail(ProviderErrorKind),
}

/// Charge adapter with scriptable behavior and a call counter.
pub struct MockProvider {
    name: String,
    calls: AtomicU32,
    mode: Mutex<MockMode>,
}

impl MockProvider {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicU32::new(0),
            mode: Mutex::new(MockMode::Succeed),
        })
    }

    pub fn charge_calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: MockMode) {
        *self.mode.lock() = mode;
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_payment(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock() {
            MockMode::Succeed => Ok(ChargeOutcome {
                provider_transaction_id: format!("{}_tx_{}", self.name, request.transaction_id),
                payment_url: Some(format!("https://{}.example/pay", self.name)),
                completed: false,
                raw_response: Value::Null,
            }),
            MockMode::Fail(kind) => Err(ProviderError::new(&self.name, kind, "scripted failure")),
        }
    }

    async fn get_status(&self, _id: &str) -> Result<StatusOutcome, ProviderError> {
        Ok(StatusOutcome {
            status: RemoteStatus::Processing,
            raw_response: Value::Null,
        })
    }

    async fn process_refund(&self, request: &RefundCallRequest) -> Result<RefundOutcome, ProviderError> {
        match *self.mode.lock() {
            MockMode::Succeed => Ok(RefundOutcome {
                provider_refund_id: format!("re_{}", request.refund_id),
                raw_response: Value::Null,
            }),
            MockMode::Fail(kind) => Err(ProviderError::new(&self.name, kind, "scripted failure")),
        }
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

pub fn provider_entity(name: &str, priority: i32) -> PaymentProvider {
    PaymentProvider {
        id: Uuid::new_v4(),
        name: name.to_string(),
        display_name: name.to_string(),
        status: ProviderStatus::Active,
        supported_currencies: vec!["USD".to_string()],
        priority,
        credentials: HashMap::new(),
        configurations: serde_json::json!([]),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        deleted_at: None,
    }
}

pub struct TestApp {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub refunds: Arc<RefundOrchestrator>,
    pub status: Arc<StatusReadService>,
    pub ingestor: Arc<WebhookIngestor>,
    pub processor: Arc<WebhookProcessor>,
    pub payments: Arc<InMemoryPaymentRepository>,
    pub webhook_events: Arc<InMemoryWebhookEventRepository>,
    pub publisher: Arc<InMemoryEventPublisher>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub status_cache: Arc<PaymentStatusCache>,
    pub stripe: Arc<MockProvider>,
    pub paypal: Arc<MockProvider>,
    pub stripe_provider: PaymentProvider,
    // Keeps the processor queue open for the ingestor.
    _queue_rx: tokio::sync::mpsc::Receiver<Uuid>,
}

pub async fn test_app() -> TestApp {
    let stripe_provider = provider_entity("stripe", 1);
    let paypal_provider = provider_entity("paypal", 2);

    let payments = Arc::new(InMemoryPaymentRepository::new());
    let refund_repo = Arc::new(InMemoryRefundRepository::new(payments.clone()));
    let provider_repo = Arc::new(InMemoryProviderRepository::new(vec![
        stripe_provider.clone(),
        paypal_provider,
    ]));
    let webhook_events = Arc::new(InMemoryWebhookEventRepository::new());

    let cache_store: Arc<InMemoryCacheStore> = Arc::new(InMemoryCacheStore::new());
    let publisher = Arc::new(InMemoryEventPublisher::new());
    let metrics = Metrics::unregistered();

    let breakers = Arc::new(CircuitBreakerRegistry::new(
        BreakerConfig::default(),
        cache_store.clone(),
        publisher.clone(),
        metrics.clone(),
    ));
    let latency = Arc::new(LatencyTracker::new());

    let stripe = MockProvider::new("stripe");
    let paypal = MockProvider::new("paypal");

    let mut pipelines = ProviderPipelineRegistry::new();
    for adapter in [stripe.clone(), paypal.clone()] {
        let breaker = breakers.get_or_create(adapter.name());
        pipelines.register(Arc::new(ResilientProvider::new(
            adapter,
            breaker,
            None,
            RetryPolicy::new(3, Duration::from_millis(1)),
            Duration::from_secs(5),
            latency.clone(),
            metrics.clone(),
        )));
    }
    let pipelines = Arc::new(pipelines);

    let router = Arc::new(ProviderRouter::new(
        provider_repo.clone(),
        breakers.clone(),
        latency,
    ));
    let idempotency = Arc::new(IdempotencyStore::new(
        cache_store.clone(),
        &IdempotencyConfig::default(),
    ));
    let status_cache = Arc::new(PaymentStatusCache::new(
        cache_store.clone(),
        &StatusCacheConfig::default(),
        metrics.clone(),
    ));

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        payments.clone(),
        router,
        pipelines.clone(),
        idempotency.clone(),
        publisher.clone(),
        status_cache.clone(),
    ));
    let refunds = Arc::new(RefundOrchestrator::new(
        payments.clone(),
        refund_repo.clone(),
        pipelines,
        idempotency,
        publisher.clone(),
        status_cache.clone(),
    ));
    let status = Arc::new(StatusReadService::new(payments.clone(), status_cache.clone()));

    // The webhook path runs the real Stripe adapter so signatures matter.
    let mut webhook_adapters = AdapterRegistry::new();
    webhook_adapters.register(Arc::new(
        StripeAdapter::new(
            "sk_test_fake".to_string(),
            STRIPE_WEBHOOK_SECRET.to_string(),
            None,
            Duration::from_secs(5),
        )
        .expect("stripe adapter"),
    ));

    let (queue_sender, queue_rx) = webhook_queue(64);
    let ingestor = Arc::new(WebhookIngestor::new(
        provider_repo,
        webhook_adapters,
        webhook_events.clone(),
        cache_store,
        queue_sender,
        metrics.clone(),
        100,
    ));
    let processor = Arc::new(WebhookProcessor::new(
        webhook_events.clone(),
        payments.clone(),
        refund_repo,
        publisher.clone(),
        status_cache.clone(),
    ));

    TestApp {
        orchestrator,
        refunds,
        status,
        ingestor,
        processor,
        payments,
        webhook_events,
        publisher,
        breakers,
        status_cache,
        stripe,
        paypal,
        stripe_provider,
        _queue_rx: queue_rx,
    }
}

pub fn payment_request(amount: rust_decimal::Decimal, order: &str) -> SubmitPaymentRequest {
    SubmitPaymentRequest {
        amount,
        currency: "USD".to_string(),
        customer_id: "c1".to_string(),
        order_id: order.to_string(),
        description: None,
        return_url: None,
        cancel_url: None,
        metadata: HashMap::new(),
        preferred_provider: None,
    }
}

/// Seeds a payment in Processing, the state a Stripe webhook completes.
pub async fn seeded_processing_payment(app: &TestApp) -> PaymentTransaction {
    let mut tx = PaymentTransaction::create(
        IdempotencyKey::new(format!("seed-{}", Uuid::new_v4())).unwrap(),
        Amount::new_payment(dec!(99.99), Currency::new("USD").unwrap()).unwrap(),
        "c1".to_string(),
        "o1".to_string(),
        app.stripe_provider.id,
        "stripe".to_string(),
        None,
        None,
        None,
        HashMap::new(),
        CorrelationId::new(),
    );
    let created = TransactionLog::record(
        tx.id,
        None,
        tx.status,
        "PaymentCreated",
        None,
        None,
        None,
        tx.correlation_id.clone(),
    );
    app.payments.create(&tx, &created).await.unwrap();

    tx.mark_processing("pi_123".to_string(), None).unwrap();
    let processing = TransactionLog::record(
        tx.id,
        Some(PaymentStatus::Pending),
        tx.status,
        "PaymentProcessing",
        None,
        None,
        None,
        tx.correlation_id.clone(),
    );
    app.payments.update(&tx, &processing).await.unwrap();
    tx.row_version += 1;
    tx
}

/// Builds a `Stripe-Signature` header for a payload, the way Stripe signs:
/// HMAC-SHA256 over `"{t}.{payload}"`.
pub fn stripe_signature(payload: &str, timestamp: i64) -> String {
    let signed = format!("{}.{}", timestamp, payload);
    let mac = hmac_sha256::HMAC::mac(signed.as_bytes(), STRIPE_WEBHOOK_SECRET.as_bytes());
    let hex: String = mac.iter().map(|b| format!("{:02x}", b)).collect();
    format!("t={},v1={}", timestamp, hex)
}

pub fn stripe_headers(payload: &str) -> WebhookHeaders {
    let header = stripe_signature(payload, chrono::Utc::now().timestamp());
    WebhookHeaders::from([("Stripe-Signature", header.as_str())])
}
