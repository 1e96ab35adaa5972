use std::sync::Arc;
use uuid::Uuid;

use crate::shared::domain::errors::AppError;
use crate::shared::infrastructure::event_bus::{EventPublisher, LIFECYCLE_TOPIC};

use crate::bounded_contexts::payment::domain::entities::{RefundTransaction, TransactionLog};
use crate::bounded_contexts::payment::domain::events::{to_envelope, RefundLifecycleEvent};
use crate::bounded_contexts::payment::domain::repository::{
    PaymentTransactionRepository, RefundTransactionRepository,
};
use crate::bounded_contexts::payment::domain::services::validate_refund;
use crate::bounded_contexts::payment::domain::value_objects::{
    Amount, OperationType, RefundId, TransactionId,
};
use crate::bounded_contexts::payment::infrastructure::idempotency::IdempotencyStore;
use crate::bounded_contexts::payment::infrastructure::providers::RefundCallRequest;
use crate::bounded_contexts::payment::infrastructure::resilience::ProviderPipelineRegistry;
use crate::bounded_contexts::payment::infrastructure::status_cache::PaymentStatusCache;

use super::dto::{PaymentStatusView, RefundRequest, RefundResponse, ValidatedRefund};

const PARENT_UPDATE_RETRIES: u32 = 3;

/// Coordinates a partial or full refund: validates the refundable remainder,
/// runs the provider call through the pipeline, and moves the parent payment
/// to Refunded/PartiallyRefunded in the same durable transaction as the
/// refund outcome.
pub struct RefundOrchestrator {
    payments: Arc<dyn PaymentTransactionRepository>,
    refunds: Arc<dyn RefundTransactionRepository>,
    pipelines: Arc<ProviderPipelineRegistry>,
    idempotency: Arc<IdempotencyStore>,
    publisher: Arc<dyn EventPublisher>,
    cache: Arc<PaymentStatusCache>,
}

impl RefundOrchestrator {
    pub fn new(
        payments: Arc<dyn PaymentTransactionRepository>,
        refunds: Arc<dyn RefundTransactionRepository>,
        pipelines: Arc<ProviderPipelineRegistry>,
        idempotency: Arc<IdempotencyStore>,
        publisher: Arc<dyn EventPublisher>,
        cache: Arc<PaymentStatusCache>,
    ) -> Self {
        Self {
            payments,
            refunds,
            pipelines,
            idempotency,
            publisher,
            cache,
        }
    }

    pub async fn submit_refund(
        &self,
        payment_transaction_id: Uuid,
        request: RefundRequest,
        idempotency_key: &str,
        correlation_id: paygrid_types::CorrelationId,
    ) -> Result<RefundResponse, AppError> {
        let validated = request.validate(payment_transaction_id, idempotency_key, correlation_id)?;

        if let Some(refund_id) = self
            .idempotency
            .get_result(OperationType::Refund, &validated.idempotency_key)
            .await?
        {
            if let Some(existing) = self.refunds.find_by_id(RefundId::from_uuid(refund_id)).await? {
                return Ok(RefundResponse::from_refund(&existing, true));
            }
        }

        if let Some(existing) = self
            .refunds
            .find_by_idempotency_key(validated.idempotency_key.value())
            .await?
        {
            return Ok(RefundResponse::from_refund(&existing, true));
        }

        if !self
            .idempotency
            .acquire_lock(OperationType::Refund, &validated.idempotency_key)
            .await?
        {
            return Err(AppError::ConcurrentRequest(format!(
                "Another refund with key {} is in flight",
                validated.idempotency_key
            )));
        }

        let result = self.refund_locked(&validated).await;

        if let Err(e) = self
            .idempotency
            .release_lock(OperationType::Refund, &validated.idempotency_key)
            .await
        {
            tracing::warn!(key = %validated.idempotency_key, error = %e, "failed to release refund lock");
        }

        result
    }

    async fn refund_locked(&self, request: &ValidatedRefund) -> Result<RefundResponse, AppError> {
        if let Some(existing) = self
            .refunds
            .find_by_idempotency_key(request.idempotency_key.value())
            .await?
        {
            return Ok(RefundResponse::from_refund(&existing, true));
        }

        let parent_id = TransactionId::from_uuid(request.payment_transaction_id);
        let parent = self
            .payments
            .find_by_id(parent_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Payment {} not found", request.payment_transaction_id))
            })?;

        let completed_total = self.refunds.completed_amount_for(parent_id).await?;
        let amount = Amount::new(request.amount, parent.currency().clone())?;
        validate_refund(&parent, completed_total, &amount, request.refund_type)?;

        let pipeline = self.pipelines.get(&parent.provider_name).ok_or_else(|| {
            AppError::NoProviderAvailable(format!(
                "No adapter configured for {}",
                parent.provider_name
            ))
        })?;

        let mut refund = RefundTransaction::create(
            request.idempotency_key.clone(),
            parent.id,
            parent.provider_id,
            amount,
            request.refund_type,
            request.reason.clone(),
            request.correlation_id.clone(),
        );

        let initiated_log = TransactionLog::record(
            parent.id,
            Some(parent.status),
            parent.status,
            "RefundInitiated",
            Some(format!(
                "Refund {} of {} initiated",
                refund.id,
                refund.amount.value()
            )),
            None,
            None,
            refund.correlation_id.clone(),
        );
        self.refunds.create(&refund, &initiated_log).await?;

        let initiated = RefundLifecycleEvent::initiated(&refund, &parent.provider_name);
        if let Err(e) = self.publisher.publish(LIFECYCLE_TOPIC, &to_envelope(&initiated)).await {
            tracing::warn!(refund_id = %refund.id, error = %e, "failed to publish refund.initiated");
        }

        let call = RefundCallRequest {
            refund_id: refund.id.value(),
            provider_transaction_id: parent.provider_transaction_id.clone(),
            amount: refund.amount.value(),
            currency: refund.amount.currency().code().to_string(),
            reason: refund.reason.clone(),
        };

        match pipeline.refund(&call).await {
            Ok(outcome) => {
                refund.mark_completed(outcome.provider_refund_id.clone());
                self.complete_refund(&mut refund).await?;

                let event = RefundLifecycleEvent::completed(&refund, &parent.provider_name);
                if let Err(e) = self.publisher.publish(LIFECYCLE_TOPIC, &to_envelope(&event)).await {
                    tracing::warn!(refund_id = %refund.id, error = %e, "failed to publish refund.completed");
                }

                self.store_result(&refund).await;
                Ok(RefundResponse::from_refund(&refund, false))
            }
            Err(provider_err) => {
                refund.mark_failed(provider_err.message.clone());
                if let Err(e) = self.refunds.update(&refund).await {
                    tracing::error!(refund_id = %refund.id, error = %e, "failed to persist refund failure");
                }

                let event = RefundLifecycleEvent::failed(&refund, &parent.provider_name);
                if let Err(e) = self.publisher.publish(LIFECYCLE_TOPIC, &to_envelope(&event)).await {
                    tracing::warn!(refund_id = %refund.id, error = %e, "failed to publish refund.failed");
                }

                self.store_result(&refund).await;
                Err(AppError::Provider(provider_err))
            }
        }
    }

    /// Persists the completed refund and the parent's refund-driven status in
    /// one durable transaction, retrying optimistic conflicts with a fresh
    /// parent snapshot.
    async fn complete_refund(&self, refund: &mut RefundTransaction) -> Result<(), AppError> {
        for attempt in 0..PARENT_UPDATE_RETRIES {
            let mut parent = self
                .payments
                .find_by_id(refund.payment_transaction_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "Payment {} disappeared during refund",
                        refund.payment_transaction_id
                    ))
                })?;

            // The refund row is not Completed in the store yet, so the stored
            // aggregate excludes it.
            let stored_total = self
                .refunds
                .completed_amount_for(refund.payment_transaction_id)
                .await?;
            let new_total = stored_total + refund.amount.value();
            let previous = parent.apply_refund_total(new_total)?;

            let log = TransactionLog::record(
                parent.id,
                Some(previous),
                parent.status,
                "RefundCompleted",
                Some(format!(
                    "Refund {} completed, {} of {} refunded",
                    refund.id,
                    new_total,
                    parent.amount.value()
                )),
                None,
                None,
                refund.correlation_id.clone(),
            );

            match self.refunds.update_with_parent(refund, &parent, &log).await {
                Ok(()) => {
                    self.cache
                        .put(&PaymentStatusView::from_transaction(&parent))
                        .await;
                    return Ok(());
                }
                Err(AppError::ConcurrencyConflict(_)) if attempt + 1 < PARENT_UPDATE_RETRIES => {
                    tracing::debug!(
                        refund_id = %refund.id,
                        attempt,
                        "parent version conflict during refund completion, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::ConcurrencyConflict(format!(
            "Refund {} could not be applied after {} attempts",
            refund.id, PARENT_UPDATE_RETRIES
        )))
    }

    async fn store_result(&self, refund: &RefundTransaction) {
        if let Err(e) = self
            .idempotency
            .store_result(OperationType::Refund, &refund.idempotency_key, refund.id.value())
            .await
        {
            tracing::warn!(refund_id = %refund.id, error = %e, "failed to cache refund result");
        }
    }
}
