use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::shared::domain::errors::AppError;
use crate::shared::infrastructure::event_bus::{EventPublisher, LIFECYCLE_TOPIC};

use crate::bounded_contexts::payment::domain::entities::{
    TransactionLog, WebhookEvent, WebhookProcessingStatus,
};
use crate::bounded_contexts::payment::domain::events::{to_envelope, PaymentLifecycleEvent};
use crate::bounded_contexts::payment::domain::repository::{
    PaymentTransactionRepository, RefundTransactionRepository, WebhookEventRepository,
};
use crate::bounded_contexts::payment::domain::services::{
    extract_transaction_id, map_event_to_target, WebhookTarget,
};
use crate::bounded_contexts::payment::domain::value_objects::{PaymentStatus, TransactionId};
use crate::bounded_contexts::payment::infrastructure::status_cache::PaymentStatusCache;

use super::WebhookQueueSender;

/// Failure backoff staircase, in minutes. Attempts beyond the staircase keep
/// the last step; retention cleanup bounds the tail.
const RETRY_STAIRCASE_MIN: [i64; 5] = [1, 5, 15, 60, 360];

fn next_retry_after(attempts: i32) -> DateTime<Utc> {
    let index = (attempts.max(1) as usize - 1).min(RETRY_STAIRCASE_MIN.len() - 1);
    Utc::now() + chrono::Duration::minutes(RETRY_STAIRCASE_MIN[index])
}

const CONFLICT_RETRIES: u32 = 3;

/// Maps persisted webhook events onto payment state transitions. One attempt
/// per trigger; failures reschedule through `next_retry_at`.
pub struct WebhookProcessor {
    events: Arc<dyn WebhookEventRepository>,
    payments: Arc<dyn PaymentTransactionRepository>,
    refunds: Arc<dyn RefundTransactionRepository>,
    publisher: Arc<dyn EventPublisher>,
    cache: Arc<PaymentStatusCache>,
}

impl WebhookProcessor {
    pub fn new(
        events: Arc<dyn WebhookEventRepository>,
        payments: Arc<dyn PaymentTransactionRepository>,
        refunds: Arc<dyn RefundTransactionRepository>,
        publisher: Arc<dyn EventPublisher>,
        cache: Arc<PaymentStatusCache>,
    ) -> Self {
        Self {
            events,
            payments,
            refunds,
            publisher,
            cache,
        }
    }

    /// Worker loop over the bounded queue. Ends when every sender is gone,
    /// which drains in-flight work on shutdown.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<Uuid>) {
        tracing::info!("webhook processor started");
        while let Some(event_id) = queue.recv().await {
            if let Err(e) = self.process(event_id).await {
                tracing::warn!(%event_id, error = %e, "webhook processing failed");
            }
        }
        tracing::info!("webhook processor drained and stopped");
    }

    pub async fn process(&self, event_id: Uuid) -> Result<(), AppError> {
        let mut event = match self.events.find_by_id(event_id).await? {
            Some(event) => event,
            None => {
                tracing::warn!(%event_id, "webhook event vanished before processing");
                return Ok(());
            }
        };

        if matches!(
            event.processing_status,
            WebhookProcessingStatus::Completed | WebhookProcessingStatus::Duplicate
        ) {
            return Ok(());
        }

        // A different row may own this natural key if this one lost an
        // ingest race that was not detected in time.
        if let Some(existing) = self
            .events
            .find_by_provider_event(event.provider_id, &event.provider_event_id)
            .await?
        {
            if existing.id != event.id {
                event.mark_duplicate();
                self.update_event(&mut event).await?;
                return Ok(());
            }
        }

        event.begin_processing();
        self.update_event(&mut event).await?;

        match self.apply(&mut event).await {
            Ok(()) => {
                event.finish_processing();
                self.update_event(&mut event).await?;
                Ok(())
            }
            Err(e) => {
                let retry_at = next_retry_after(event.processing_attempts);
                event.fail_processing(e.to_string(), Some(retry_at));
                self.update_event(&mut event).await?;
                Err(e)
            }
        }
    }

    /// Repository update that keeps the in-memory version token current.
    async fn update_event(&self, event: &mut WebhookEvent) -> Result<(), AppError> {
        self.events.update(event).await?;
        event.row_version += 1;
        Ok(())
    }

    async fn apply(&self, event: &mut WebhookEvent) -> Result<(), AppError> {
        let payload = match &event.parsed_payload {
            Some(payload) => payload.clone(),
            None => serde_json::from_str(&event.raw_payload)
                .map_err(|e| AppError::Validation(format!("Webhook payload is not JSON: {}", e)))?,
        };
        event.parsed_payload = Some(payload.clone());

        let transaction_id = extract_transaction_id(&payload).ok_or_else(|| {
            AppError::Validation(format!(
                "Webhook {} carries no transaction reference",
                event.provider_event_id
            ))
        })?;
        event.payment_transaction_id = Some(TransactionId::from_uuid(transaction_id));

        let target = map_event_to_target(&event.event_type);

        for attempt in 0..CONFLICT_RETRIES {
            let mut payment = self
                .payments
                .find_by_id(TransactionId::from_uuid(transaction_id))
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Payment {} referenced by webhook not found", transaction_id))
                })?;

            let change = self.plan_transition(&mut payment, target).await?;
            let (previous, lifecycle) = match change {
                Some(pair) => pair,
                None => {
                    tracing::debug!(
                        %transaction_id,
                        event_type = %event.event_type,
                        "webhook requires no state change"
                    );
                    return Ok(());
                }
            };

            let log = TransactionLog::record(
                payment.id,
                Some(previous),
                payment.status,
                "WebhookStatusUpdate",
                Some(format!(
                    "Status driven by {} webhook event {}",
                    event.event_type, event.provider_event_id
                )),
                event.parsed_payload.clone(),
                None,
                payment.correlation_id.clone(),
            );

            match self.payments.update(&payment, &log).await {
                Ok(()) => {
                    self.cache.invalidate(payment.id.value()).await;
                    if let Some(kind) = lifecycle {
                        let lifecycle_event = match kind {
                            LifecycleKind::Completed => PaymentLifecycleEvent::completed(&payment),
                            LifecycleKind::Failed => PaymentLifecycleEvent::failed(&payment),
                        };
                        if let Err(e) = self
                            .publisher
                            .publish(LIFECYCLE_TOPIC, &to_envelope(&lifecycle_event))
                            .await
                        {
                            tracing::warn!(%transaction_id, error = %e, "failed to publish lifecycle event");
                        }
                    }
                    return Ok(());
                }
                Err(AppError::ConcurrencyConflict(_)) if attempt + 1 < CONFLICT_RETRIES => {
                    tracing::debug!(%transaction_id, attempt, "version conflict applying webhook, re-reading");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::ConcurrencyConflict(format!(
            "Webhook for payment {} lost {} version races",
            transaction_id, CONFLICT_RETRIES
        )))
    }

    /// Applies the target to the payment snapshot. Returns the previous
    /// status and an optional lifecycle event kind, or None when the webhook
    /// is a no-op for the current state.
    async fn plan_transition(
        &self,
        payment: &mut crate::bounded_contexts::payment::domain::entities::PaymentTransaction,
        target: WebhookTarget,
    ) -> Result<Option<(PaymentStatus, Option<LifecycleKind>)>, AppError> {
        match target {
            WebhookTarget::Completed => {
                if payment.status == PaymentStatus::Completed {
                    return Ok(None);
                }
                if !payment.status.can_transition_to(PaymentStatus::Completed) {
                    tracing::warn!(
                        transaction_id = %payment.id,
                        status = %payment.status,
                        "ignoring completion webhook for non-completable payment"
                    );
                    return Ok(None);
                }
                let previous = payment.mark_completed(None)?;
                Ok(Some((previous, Some(LifecycleKind::Completed))))
            }
            WebhookTarget::Failed => {
                if !payment.status.can_transition_to(PaymentStatus::Failed) {
                    return Ok(None);
                }
                let previous =
                    payment.mark_failed("Reported failed by provider webhook".to_string(), None)?;
                Ok(Some((previous, Some(LifecycleKind::Failed))))
            }
            WebhookTarget::Processing => {
                if payment.status != PaymentStatus::Pending {
                    return Ok(None);
                }
                let provider_tx_id = payment.provider_transaction_id.clone();
                let previous = payment.mark_processing(provider_tx_id, None)?;
                Ok(Some((previous, None)))
            }
            WebhookTarget::Refunded => {
                // Refund-driven status is derived from the refund aggregate,
                // never from the event name alone.
                let total = self.refunds.completed_amount_for(payment.id).await?;
                let before = payment.status;
                payment.apply_refund_total(total)?;
                if payment.status == before {
                    return Ok(None);
                }
                Ok(Some((before, None)))
            }
        }
    }
}

#[derive(Clone, Copy)]
enum LifecycleKind {
    Completed,
    Failed,
}

/// Periodically re-enqueues Failed events whose `next_retry_at` has passed.
pub struct WebhookRetryScanner {
    events: Arc<dyn WebhookEventRepository>,
    queue: WebhookQueueSender,
    interval: Duration,
    batch: i64,
}

impl WebhookRetryScanner {
    pub fn new(
        events: Arc<dyn WebhookEventRepository>,
        queue: WebhookQueueSender,
        interval: Duration,
    ) -> Self {
        Self {
            events,
            queue,
            interval,
            batch: 100,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.interval, "webhook retry scanner started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.scan_once().await {
                        tracing::warn!(error = %e, "webhook retry scan failed");
                    }
                }
            }
        }
        tracing::info!("webhook retry scanner stopped");
    }

    pub async fn scan_once(&self) -> Result<usize, AppError> {
        let due = self.events.due_for_retry(Utc::now(), self.batch).await?;
        let mut enqueued = 0;
        for event_id in due {
            if self.queue.enqueue(event_id).await {
                enqueued += 1;
            } else {
                break;
            }
        }
        if enqueued > 0 {
            tracing::info!(enqueued, "re-enqueued webhook events for retry");
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    use paygrid_types::CorrelationId;

    use crate::bounded_contexts::payment::domain::entities::PaymentTransaction;
    use crate::bounded_contexts::payment::domain::value_objects::{
        Amount, Currency, IdempotencyKey,
    };
    use crate::bounded_contexts::payment::infrastructure::repositories::{
        InMemoryPaymentRepository, InMemoryRefundRepository, InMemoryWebhookEventRepository,
    };
    use crate::config::StatusCacheConfig;
    use crate::shared::infrastructure::cache::InMemoryCacheStore;
    use crate::shared::infrastructure::event_bus::InMemoryEventPublisher;
    use crate::shared::infrastructure::metrics::Metrics;

    struct Harness {
        processor: Arc<WebhookProcessor>,
        events: Arc<InMemoryWebhookEventRepository>,
        payments: Arc<InMemoryPaymentRepository>,
        publisher: Arc<InMemoryEventPublisher>,
        cache: Arc<PaymentStatusCache>,
    }

    fn harness() -> Harness {
        let payments = Arc::new(InMemoryPaymentRepository::new());
        let refunds = Arc::new(InMemoryRefundRepository::new(payments.clone()));
        let events = Arc::new(InMemoryWebhookEventRepository::new());
        let publisher = Arc::new(InMemoryEventPublisher::new());
        let cache = Arc::new(PaymentStatusCache::new(
            Arc::new(InMemoryCacheStore::new()),
            &StatusCacheConfig::default(),
            Metrics::unregistered(),
        ));

        Harness {
            processor: Arc::new(WebhookProcessor::new(
                events.clone(),
                payments.clone(),
                refunds,
                publisher.clone(),
                cache.clone(),
            )),
            events,
            payments,
            publisher,
            cache,
        }
    }

    async fn processing_payment(h: &Harness) -> PaymentTransaction {
        let mut tx = PaymentTransaction::create(
            IdempotencyKey::new("K1").unwrap(),
            Amount::new_payment(dec!(99.99), Currency::new("USD").unwrap()).unwrap(),
            "c1".to_string(),
            "o1".to_string(),
            Uuid::new_v4(),
            "stripe".to_string(),
            None,
            None,
            None,
            HashMap::new(),
            CorrelationId::new(),
        );
        let created = TransactionLog::record(
            tx.id, None, tx.status, "PaymentCreated", None, None, None, tx.correlation_id.clone(),
        );
        h.payments.create(&tx, &created).await.unwrap();

        tx.mark_processing("pi_1".to_string(), None).unwrap();
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
        h.payments.update(&tx, &processing).await.unwrap();
        tx.row_version += 1;
        tx
    }

    async fn insert_webhook(
        h: &Harness,
        payment: &PaymentTransaction,
        event_type: &str,
    ) -> WebhookEvent {
        let payload = serde_json::json!({
            "id": "evt_1",
            "type": event_type,
            "data": {"metadata": {"transactionId": payment.id.to_string()}}
        });
        let mut event = WebhookEvent::receive(
            payment.provider_id,
            "evt_1".to_string(),
            event_type.to_string(),
            payload.to_string(),
            Some("sig".to_string()),
            None,
        );
        event.parsed_payload = Some(payload);
        h.events.insert(&event).await.unwrap();
        event
    }

    #[tokio::test]
    async fn succeeded_webhook_completes_the_payment() {
        let h = harness();
        let payment = processing_payment(&h).await;

        // Warm the status cache to verify invalidation
        h.cache
            .put(&crate::bounded_contexts::payment::application::dto::PaymentStatusView::from_transaction(&payment))
            .await;

        let event = insert_webhook(&h, &payment, "payment_intent.succeeded").await;
        h.processor.process(event.id).await.unwrap();

        let updated = h.payments.find_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(updated.status, PaymentStatus::Completed);
        assert!(updated.completed_at.is_some());

        let stored_event = h.events.find_by_id(event.id).await.unwrap().unwrap();
        assert_eq!(stored_event.processing_status, WebhookProcessingStatus::Completed);
        assert_eq!(
            stored_event.payment_transaction_id,
            Some(payment.id)
        );

        // One lifecycle event, one new audit row, cache invalidated
        assert_eq!(h.publisher.events_of_type("payment.completed").len(), 1);
        let logs = h.payments.logs_for_payment(payment.id).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(h.cache.get(payment.id.value()).await.is_none());
    }

    #[tokio::test]
    async fn reprocessing_a_completed_event_changes_nothing() {
        let h = harness();
        let payment = processing_payment(&h).await;
        let event = insert_webhook(&h, &payment, "payment_intent.succeeded").await;

        h.processor.process(event.id).await.unwrap();
        h.processor.process(event.id).await.unwrap();

        assert_eq!(h.publisher.events_of_type("payment.completed").len(), 1);
        let logs = h.payments.logs_for_payment(payment.id).await.unwrap();
        assert_eq!(logs.len(), 3);
    }

    #[tokio::test]
    async fn failed_webhook_marks_the_payment_failed() {
        let h = harness();
        let payment = processing_payment(&h).await;
        let event = insert_webhook(&h, &payment, "payment_intent.payment_failed").await;

        h.processor.process(event.id).await.unwrap();

        let updated = h.payments.find_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(updated.status, PaymentStatus::Failed);
        assert_eq!(h.publisher.events_of_type("payment.failed").len(), 1);
    }

    #[tokio::test]
    async fn unknown_transaction_schedules_a_retry() {
        let h = harness();
        let orphan = serde_json::json!({
            "id": "evt_9",
            "type": "payment_intent.succeeded",
            "data": {"metadata": {"transactionId": Uuid::new_v4().to_string()}}
        });
        let mut event = WebhookEvent::receive(
            Uuid::new_v4(),
            "evt_9".to_string(),
            "payment_intent.succeeded".to_string(),
            orphan.to_string(),
            None,
            None,
        );
        event.parsed_payload = Some(orphan);
        h.events.insert(&event).await.unwrap();

        let result = h.processor.process(event.id).await;
        assert!(result.is_err());

        let stored = h.events.find_by_id(event.id).await.unwrap().unwrap();
        assert_eq!(stored.processing_status, WebhookProcessingStatus::Failed);
        assert_eq!(stored.processing_attempts, 1);
        assert!(stored.next_retry_at.is_some());
    }

    #[tokio::test]
    async fn retry_staircase_follows_the_documented_steps() {
        // 1, 5, 15, 60, 360 minutes; later attempts stay on the last step
        let now = Utc::now();
        for (attempt, minutes) in [(1, 1i64), (2, 5), (3, 15), (4, 60), (5, 360), (9, 360)] {
            let at = next_retry_after(attempt);
            let delta = at - now;
            assert!(
                (delta - chrono::Duration::minutes(minutes)).num_seconds().abs() <= 1,
                "attempt {} expected ~{}m",
                attempt,
                minutes
            );
        }
    }

    #[tokio::test]
    async fn scanner_reenqueues_due_events() {
        let h = harness();
        let payment = processing_payment(&h).await;
        let mut event = insert_webhook(&h, &payment, "payment_intent.succeeded").await;

        event.fail_processing(
            "transient".to_string(),
            Some(Utc::now() - chrono::Duration::minutes(1)),
        );
        h.events.update(&event).await.unwrap();

        let (sender, mut rx) = super::super::webhook_queue(4);
        let scanner = WebhookRetryScanner::new(h.events.clone(), sender, Duration::from_secs(60));

        let enqueued = scanner.scan_once().await.unwrap();
        assert_eq!(enqueued, 1);
        assert_eq!(rx.recv().await, Some(event.id));
    }

    #[tokio::test]
    async fn worker_drains_the_queue_on_shutdown() {
        let h = harness();
        let payment = processing_payment(&h).await;
        let event = insert_webhook(&h, &payment, "payment_intent.succeeded").await;

        let (sender, rx) = super::super::webhook_queue(4);
        let worker = tokio::spawn(h.processor.clone().run(rx));

        assert!(sender.enqueue(event.id).await);
        drop(sender);

        // Worker ends once every sender is gone, after finishing the queue
        worker.await.unwrap();

        let updated = h.payments.find_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(updated.status, PaymentStatus::Completed);
    }
}
