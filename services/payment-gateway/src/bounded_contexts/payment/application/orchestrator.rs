use std::sync::Arc;

use crate::shared::domain::errors::AppError;
use crate::shared::infrastructure::event_bus::{EventPublisher, LIFECYCLE_TOPIC};

use crate::bounded_contexts::payment::domain::entities::{PaymentTransaction, TransactionLog};
use crate::bounded_contexts::payment::domain::events::{to_envelope, PaymentLifecycleEvent};
use crate::bounded_contexts::payment::domain::repository::PaymentTransactionRepository;
use crate::bounded_contexts::payment::domain::value_objects::{OperationType, TransactionId};
use crate::bounded_contexts::payment::infrastructure::idempotency::IdempotencyStore;
use crate::bounded_contexts::payment::infrastructure::providers::{ChargeRequest, ProviderRouter};
use crate::bounded_contexts::payment::infrastructure::resilience::ProviderPipelineRegistry;
use crate::bounded_contexts::payment::infrastructure::status_cache::PaymentStatusCache;

use super::dto::{PaymentResponse, PaymentStatusView, SubmitPaymentRequest, ValidatedPayment};

/// Coordinates one payment submission end to end: idempotency, routing,
/// persistence, the provider call through the resilience pipeline, audit and
/// event publication.
pub struct PaymentOrchestrator {
    payments: Arc<dyn PaymentTransactionRepository>,
    router: Arc<ProviderRouter>,
    pipelines: Arc<ProviderPipelineRegistry>,
    idempotency: Arc<IdempotencyStore>,
    publisher: Arc<dyn EventPublisher>,
    cache: Arc<PaymentStatusCache>,
}

impl PaymentOrchestrator {
    pub fn new(
        payments: Arc<dyn PaymentTransactionRepository>,
        router: Arc<ProviderRouter>,
        pipelines: Arc<ProviderPipelineRegistry>,
        idempotency: Arc<IdempotencyStore>,
        publisher: Arc<dyn EventPublisher>,
        cache: Arc<PaymentStatusCache>,
    ) -> Self {
        Self {
            payments,
            router,
            pipelines,
            idempotency,
            publisher,
            cache,
        }
    }

    pub async fn submit_payment(
        &self,
        request: SubmitPaymentRequest,
        idempotency_key: &str,
        correlation_id: paygrid_types::CorrelationId,
    ) -> Result<PaymentResponse, AppError> {
        let validated = request.validate(idempotency_key, correlation_id)?;

        // Fast path: a cached result resolves straight to the persisted row.
        if let Some(tx_id) = self
            .idempotency
            .get_result(OperationType::Payment, &validated.idempotency_key)
            .await?
        {
            if let Some(existing) = self.payments.find_by_id(TransactionId::from_uuid(tx_id)).await? {
                return Ok(PaymentResponse::from_transaction(&existing, true));
            }
        }

        // Durable echo: the row is the source of truth.
        if let Some(existing) = self
            .payments
            .find_by_idempotency_key(validated.idempotency_key.value())
            .await?
        {
            return Ok(PaymentResponse::from_transaction(&existing, true));
        }

        if !self
            .idempotency
            .acquire_lock(OperationType::Payment, &validated.idempotency_key)
            .await?
        {
            return Err(AppError::ConcurrentRequest(format!(
                "Another submission with key {} is in flight",
                validated.idempotency_key
            )));
        }

        let result = self.submit_locked(&validated).await;

        if let Err(e) = self
            .idempotency
            .release_lock(OperationType::Payment, &validated.idempotency_key)
            .await
        {
            tracing::warn!(key = %validated.idempotency_key, error = %e, "failed to release idempotency lock");
        }

        result
    }

    async fn submit_locked(&self, request: &ValidatedPayment) -> Result<PaymentResponse, AppError> {
        // Double-checked: a racer may have persisted between lookup and lock.
        if let Some(existing) = self
            .payments
            .find_by_idempotency_key(request.idempotency_key.value())
            .await?
        {
            return Ok(PaymentResponse::from_transaction(&existing, true));
        }

        let provider = self
            .router
            .select(request.amount.currency(), request.preferred_provider.as_deref())
            .await?;
        let pipeline = self.pipelines.get(&provider.name).ok_or_else(|| {
            AppError::NoProviderAvailable(format!("No adapter configured for {}", provider.name))
        })?;

        let mut tx = PaymentTransaction::create(
            request.idempotency_key.clone(),
            request.amount.clone(),
            request.customer_id.clone(),
            request.order_id.clone(),
            provider.id,
            provider.name.clone(),
            request.description.clone(),
            request.return_url.clone(),
            request.cancel_url.clone(),
            request.metadata.clone(),
            request.correlation_id.clone(),
        );

        let created_log = TransactionLog::record(
            tx.id,
            None,
            tx.status,
            "PaymentCreated",
            Some(format!("Routed to provider {}", provider.name)),
            None,
            None,
            tx.correlation_id.clone(),
        );
        match self.payments.create(&tx, &created_log).await {
            Ok(()) => {}
            Err(AppError::ConcurrencyConflict(_)) => {
                // Lost a race on the unique constraint despite the lock
                // (e.g. lock expiry); replay the winner.
                if let Some(existing) = self
                    .payments
                    .find_by_idempotency_key(request.idempotency_key.value())
                    .await?
                {
                    return Ok(PaymentResponse::from_transaction(&existing, true));
                }
                return Err(AppError::ConcurrentRequest(
                    "Submission lost an idempotency race".to_string(),
                ));
            }
            Err(e) => return Err(e),
        }

        let created = PaymentLifecycleEvent::created(&tx);
        if let Err(e) = self.publisher.publish(LIFECYCLE_TOPIC, &to_envelope(&created)).await {
            tracing::warn!(transaction_id = %tx.id, error = %e, "failed to publish payment.created");
        }

        tracing::info!(
            transaction_id = %tx.id,
            provider = %provider.name,
            correlation_id = %tx.correlation_id,
            "payment created, invoking provider"
        );

        let charge = ChargeRequest {
            transaction_id: tx.id.value(),
            amount: tx.amount.value(),
            currency: tx.amount.currency().code().to_string(),
            customer_id: tx.customer_id.clone(),
            order_id: tx.order_id.clone(),
            description: tx.description.clone(),
            return_url: tx.return_url.clone(),
            cancel_url: tx.cancel_url.clone(),
            metadata: tx.metadata.clone(),
        };

        match pipeline.charge(&charge).await {
            Ok(outcome) => {
                let (previous, event_type) = if outcome.completed {
                    (
                        tx.mark_completed(Some(outcome.provider_transaction_id.clone()))?,
                        "PaymentCompleted",
                    )
                } else {
                    (
                        tx.mark_processing(
                            outcome.provider_transaction_id.clone(),
                            outcome.payment_url.clone(),
                        )?,
                        "PaymentProcessing",
                    )
                };

                let log = TransactionLog::record(
                    tx.id,
                    Some(previous),
                    tx.status,
                    event_type,
                    Some(format!("Provider {} accepted the charge", provider.name)),
                    Some(outcome.raw_response.clone()),
                    None,
                    tx.correlation_id.clone(),
                );

                // The provider has been charged; a persistence failure here
                // must surface and leave a reconciliation marker.
                if let Err(persist_err) = self.payments.update(&tx, &log).await {
                    tracing::error!(
                        transaction_id = %tx.id,
                        error = %persist_err,
                        "charge succeeded but persistence failed, flagging for reconciliation"
                    );
                    if let Err(mark_err) = self.payments.mark_needs_reconciliation(tx.id).await {
                        tracing::error!(
                            transaction_id = %tx.id,
                            error = %mark_err,
                            "failed to flag transaction for reconciliation"
                        );
                    }
                    return Err(persist_err);
                }

                if outcome.completed {
                    let event = PaymentLifecycleEvent::completed(&tx);
                    if let Err(e) = self.publisher.publish(LIFECYCLE_TOPIC, &to_envelope(&event)).await {
                        tracing::warn!(transaction_id = %tx.id, error = %e, "failed to publish payment.completed");
                    }
                }

                self.finish(&tx).await;
                Ok(PaymentResponse::from_transaction(&tx, false))
            }
            Err(provider_err) => {
                let previous = tx.mark_failed(
                    provider_err.message.clone(),
                    provider_err.code.clone(),
                )?;
                let log = TransactionLog::record(
                    tx.id,
                    Some(previous),
                    tx.status,
                    "PaymentFailed",
                    Some(provider_err.to_string()),
                    None,
                    Some(provider_err.message.clone()),
                    tx.correlation_id.clone(),
                );
                if let Err(e) = self.payments.update(&tx, &log).await {
                    tracing::error!(transaction_id = %tx.id, error = %e, "failed to persist failure state");
                }

                let event = PaymentLifecycleEvent::failed(&tx);
                if let Err(e) = self.publisher.publish(LIFECYCLE_TOPIC, &to_envelope(&event)).await {
                    tracing::warn!(transaction_id = %tx.id, error = %e, "failed to publish payment.failed");
                }

                self.finish(&tx).await;
                Err(AppError::Provider(provider_err))
            }
        }
    }

    /// Result caching and status-cache refresh shared by both outcomes.
    async fn finish(&self, tx: &PaymentTransaction) {
        if let Err(e) = self
            .idempotency
            .store_result(OperationType::Payment, &tx.idempotency_key, tx.id.value())
            .await
        {
            tracing::warn!(transaction_id = %tx.id, error = %e, "failed to cache idempotency result");
        }
        self.cache.put(&PaymentStatusView::from_transaction(tx)).await;
    }
}
