use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use payment_gateway::bounded_contexts::payment::application::orchestrator::PaymentOrchestrator;
use payment_gateway::bounded_contexts::payment::application::refunds::RefundOrchestrator;
use payment_gateway::bounded_contexts::payment::application::status::StatusReadService;
use payment_gateway::bounded_contexts::payment::infrastructure::idempotency::IdempotencyStore;
use payment_gateway::bounded_contexts::payment::infrastructure::providers::{
    AdapterRegistry, OmiseAdapter, PayPalAdapter, ProviderAdapter, ProviderRouter, ScbAdapter,
    StripeAdapter,
};
use payment_gateway::bounded_contexts::payment::infrastructure::repositories::{
    PostgresPaymentRepository, PostgresProviderRepository, PostgresRefundRepository,
    PostgresWebhookEventRepository,
};
use payment_gateway::bounded_contexts::payment::infrastructure::resilience::circuit_breaker::BreakerConfig;
use payment_gateway::bounded_contexts::payment::infrastructure::resilience::{
    CircuitBreakerRegistry, LatencyTracker, ProviderPipelineRegistry, ProviderRateLimiter,
    ResilientProvider, RetryPolicy,
};
use payment_gateway::bounded_contexts::payment::infrastructure::status_cache::PaymentStatusCache;
use payment_gateway::bounded_contexts::payment::infrastructure::webhooks::{
    webhook_queue, WebhookIngestor, WebhookProcessor, WebhookRetryScanner,
};
use payment_gateway::bounded_contexts::payment::presentation::{create_payment_routes, AppState};
use payment_gateway::config::AppConfig;
use payment_gateway::jobs::reconciliation::{PipelineSettlementSource, ReconciliationJob};
use payment_gateway::shared::domain::errors::AppError;
use payment_gateway::shared::infrastructure::cache::RedisCacheStore;
use payment_gateway::shared::infrastructure::database::DatabasePool;
use payment_gateway::shared::infrastructure::event_bus::RedisEventPublisher;
use payment_gateway::shared::infrastructure::metrics::Metrics;

const RETRY_SCAN_INTERVAL: Duration = Duration::from_secs(30);
const RECONCILIATION_INTERVAL: Duration = Duration::from_secs(300);

fn build_adapters(config: &AppConfig) -> Result<AdapterRegistry, AppError> {
    let mut registry = AdapterRegistry::new();
    let timeout = config.resilience.provider_timeout;

    if let Some(creds) = config.providers.get("stripe") {
        if !creds.api_key.is_empty() {
            registry.register(Arc::new(StripeAdapter::new(
                creds.api_key.clone(),
                creds.webhook_secret.clone(),
                creds.base_url.clone(),
                creds.timeout_override.unwrap_or(timeout),
            )?));
        }
    }
    if let Some(creds) = config.providers.get("paypal") {
        if !creds.api_key.is_empty() {
            registry.register(Arc::new(PayPalAdapter::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
                creds.webhook_id.clone(),
                creds.base_url.clone(),
                creds.timeout_override.unwrap_or(timeout),
            )?));
        }
    }
    if let Some(creds) = config.providers.get("omise") {
        if !creds.api_key.is_empty() {
            registry.register(Arc::new(OmiseAdapter::new(
                creds.api_key.clone(),
                Some(creds.webhook_secret.clone()),
                creds.ip_allowlist.clone(),
                creds.base_url.clone(),
                creds.timeout_override.unwrap_or(timeout),
            )?));
        }
    }
    if let Some(creds) = config.providers.get("scb") {
        if !creds.api_key.is_empty() {
            registry.register(Arc::new(ScbAdapter::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
                creds.webhook_secret.clone(),
                creds.base_url.clone(),
                creds.timeout_override.unwrap_or(timeout),
            )?));
        }
    }

    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(bind_addr = %config.bind_addr, "starting payment gateway");

    let db = DatabasePool::new(&config.database_url).await?;
    db.run_migrations().await?;

    let cache_store = Arc::new(RedisCacheStore::new(&config.redis_url)?);
    let publisher = Arc::new(RedisEventPublisher::new(&config.redis_url, "paygrid")?);
    let registry = prometheus::Registry::new();
    let metrics = Metrics::new(&registry)?;

    // Repositories
    let payments = Arc::new(PostgresPaymentRepository::new(db.get_pool().clone()));
    let refunds = Arc::new(PostgresRefundRepository::new(db.get_pool().clone()));
    let providers = Arc::new(PostgresProviderRepository::new(db.get_pool().clone()));
    let webhook_events = Arc::new(PostgresWebhookEventRepository::new(db.get_pool().clone()));

    // Provider adapters behind the resilience pipeline
    let adapters = build_adapters(&config)?;
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        BreakerConfig::from(&config.resilience),
        cache_store.clone(),
        publisher.clone(),
        metrics.clone(),
    ));
    let latency = Arc::new(LatencyTracker::new());

    let mut pipelines = ProviderPipelineRegistry::new();
    for name in adapters.names() {
        let adapter: Arc<dyn ProviderAdapter> = match adapters.get(&name) {
            Some(adapter) => adapter,
            None => continue,
        };
        let creds = config.providers.get(&name);
        let limiter = creds
            .and_then(|c| c.rate_limit_per_second)
            .map(|rps| ProviderRateLimiter::new(&name, rps));
        let retry = RetryPolicy::new(
            creds
                .and_then(|c| c.max_attempts_override)
                .unwrap_or(config.resilience.max_attempts),
            config.resilience.backoff_base,
        );
        let timeout = creds
            .and_then(|c| c.timeout_override)
            .unwrap_or(config.resilience.provider_timeout);

        pipelines.register(Arc::new(ResilientProvider::new(
            adapter,
            breakers.get_or_create(&name),
            limiter,
            retry,
            timeout,
            latency.clone(),
            metrics.clone(),
        )));
    }
    let pipelines = Arc::new(pipelines);

    let router = Arc::new(ProviderRouter::new(
        providers.clone(),
        breakers.clone(),
        latency.clone(),
    ));
    let idempotency = Arc::new(IdempotencyStore::new(cache_store.clone(), &config.idempotency));
    let status_cache = Arc::new(PaymentStatusCache::new(
        cache_store.clone(),
        &config.status_cache,
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
    let refund_orchestrator = Arc::new(RefundOrchestrator::new(
        payments.clone(),
        refunds.clone(),
        pipelines.clone(),
        idempotency,
        publisher.clone(),
        status_cache.clone(),
    ));
    let status_service = Arc::new(StatusReadService::new(payments.clone(), status_cache.clone()));

    // Webhook plumbing: bounded queue, worker, retry scanner
    let (queue_sender, queue_receiver) = webhook_queue(config.webhooks.queue_capacity);
    let processor = Arc::new(WebhookProcessor::new(
        webhook_events.clone(),
        payments.clone(),
        refunds.clone(),
        publisher.clone(),
        status_cache.clone(),
    ));
    let worker = tokio::spawn(processor.clone().run(queue_receiver));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scanner = WebhookRetryScanner::new(
        webhook_events.clone(),
        queue_sender.clone(),
        RETRY_SCAN_INTERVAL,
    );
    let scanner_task = tokio::spawn(scanner.run(shutdown_rx.clone()));

    let reconciliation = ReconciliationJob::new(
        payments.clone(),
        Arc::new(PipelineSettlementSource::new(pipelines.clone())),
        publisher.clone(),
        RECONCILIATION_INTERVAL,
    );
    let reconciliation_task = tokio::spawn(reconciliation.run(shutdown_rx));

    let ingestor = Arc::new(WebhookIngestor::new(
        providers,
        adapters,
        webhook_events,
        cache_store,
        queue_sender,
        metrics,
        config.webhooks.rate_limit_per_minute,
    ));

    let state = AppState {
        orchestrator,
        refunds: refund_orchestrator,
        status: status_service,
        ingestor,
        db,
    };
    let app = create_payment_routes(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Stop the periodic jobs, then drain the webhook queue: the worker exits
    // once the last sender (held by the dropped router state) is gone.
    let _ = shutdown_tx.send(true);
    let _ = scanner_task.await;
    let _ = reconciliation_task.await;
    let _ = worker.await;

    tracing::info!("payment gateway stopped");
    Ok(())
}
