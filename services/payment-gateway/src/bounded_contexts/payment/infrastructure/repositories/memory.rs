//! In-memory repository implementations backing the unit and integration
//! test suites. Uniqueness and optimistic-concurrency semantics mirror the
//! Postgres implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::domain::errors::AppError;

use crate::bounded_contexts::payment::domain::entities::{
    PaymentProvider, PaymentTransaction, RefundTransaction, TransactionLog, WebhookEvent,
    WebhookProcessingStatus,
};
use crate::bounded_contexts::payment::domain::repository::{
    PaymentTransactionRepository, ProviderRepository, RefundTransactionRepository,
    WebhookEventRepository, WebhookInsertOutcome,
};
use crate::bounded_contexts::payment::domain::value_objects::{Currency, RefundId, TransactionId};

#[derive(Default)]
struct PaymentStore {
    payments: HashMap<Uuid, PaymentTransaction>,
    logs: Vec<TransactionLog>,
}

#[derive(Default)]
pub struct InMemoryPaymentRepository {
    store: Mutex<PaymentStore>,
}

impl InMemoryPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_locked(
        store: &mut PaymentStore,
        tx: &PaymentTransaction,
        log: &TransactionLog,
    ) -> Result<(), AppError> {
        let key_taken = store
            .payments
            .values()
            .any(|existing| existing.idempotency_key == tx.idempotency_key);
        if key_taken {
            return Err(AppError::ConcurrencyConflict(format!(
                "Idempotency key {} already persisted",
                tx.idempotency_key
            )));
        }
        store.payments.insert(tx.id.value(), tx.clone());
        store.logs.push(log.clone());
        Ok(())
    }

    fn update_locked(
        store: &mut PaymentStore,
        tx: &PaymentTransaction,
        log: &TransactionLog,
    ) -> Result<(), AppError> {
        let stored = store
            .payments
            .get_mut(&tx.id.value())
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", tx.id)))?;
        if stored.row_version != tx.row_version {
            return Err(AppError::ConcurrencyConflict(format!(
                "Payment {} version {} is stale",
                tx.id, tx.row_version
            )));
        }
        let mut updated = tx.clone();
        updated.row_version += 1;
        *stored = updated;
        store.logs.push(log.clone());
        Ok(())
    }
}

#[async_trait]
impl PaymentTransactionRepository for InMemoryPaymentRepository {
    async fn create(&self, tx: &PaymentTransaction, log: &TransactionLog) -> Result<(), AppError> {
        let mut store = self.store.lock();
        Self::insert_locked(&mut store, tx, log)
    }

    async fn update(&self, tx: &PaymentTransaction, log: &TransactionLog) -> Result<(), AppError> {
        let mut store = self.store.lock();
        Self::update_locked(&mut store, tx, log)
    }

    async fn find_by_id(&self, id: TransactionId) -> Result<Option<PaymentTransaction>, AppError> {
        Ok(self.store.lock().payments.get(&id.value()).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, AppError> {
        Ok(self
            .store
            .lock()
            .payments
            .values()
            .find(|tx| tx.idempotency_key.value() == key)
            .cloned())
    }

    async fn mark_needs_reconciliation(&self, id: TransactionId) -> Result<(), AppError> {
        let mut store = self.store.lock();
        let stored = store
            .payments
            .get_mut(&id.value())
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", id)))?;
        stored.needs_reconciliation = true;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn find_needing_reconciliation(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, AppError> {
        Ok(self
            .store
            .lock()
            .payments
            .values()
            .filter(|tx| tx.needs_reconciliation)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn logs_for_payment(&self, id: TransactionId) -> Result<Vec<TransactionLog>, AppError> {
        Ok(self
            .store
            .lock()
            .logs
            .iter()
            .filter(|log| log.payment_transaction_id == id)
            .cloned()
            .collect())
    }
}

pub struct InMemoryRefundRepository {
    refunds: Mutex<HashMap<Uuid, RefundTransaction>>,
    payments: Arc<InMemoryPaymentRepository>,
}

impl InMemoryRefundRepository {
    pub fn new(payments: Arc<InMemoryPaymentRepository>) -> Self {
        Self {
            refunds: Mutex::new(HashMap::new()),
            payments,
        }
    }
}

#[async_trait]
impl RefundTransactionRepository for InMemoryRefundRepository {
    async fn create(&self, refund: &RefundTransaction, log: &TransactionLog) -> Result<(), AppError> {
        let mut refunds = self.refunds.lock();
        let key_taken = refunds
            .values()
            .any(|existing| existing.idempotency_key == refund.idempotency_key);
        if key_taken {
            return Err(AppError::ConcurrencyConflict(format!(
                "Idempotency key {} already persisted",
                refund.idempotency_key
            )));
        }
        refunds.insert(refund.id.value(), refund.clone());
        drop(refunds);

        self.payments.store.lock().logs.push(log.clone());
        Ok(())
    }

    async fn update_with_parent(
        &self,
        refund: &RefundTransaction,
        parent: &PaymentTransaction,
        log: &TransactionLog,
    ) -> Result<(), AppError> {
        // Parent version check first so a conflict leaves the refund intact.
        {
            let mut store = self.payments.store.lock();
            InMemoryPaymentRepository::update_locked(&mut store, parent, log)?;
        }

        let mut refunds = self.refunds.lock();
        let stored = refunds
            .get_mut(&refund.id.value())
            .ok_or_else(|| AppError::NotFound(format!("Refund {} not found", refund.id)))?;
        if stored.row_version != refund.row_version {
            return Err(AppError::ConcurrencyConflict(format!(
                "Refund {} version {} is stale",
                refund.id, refund.row_version
            )));
        }
        let mut updated = refund.clone();
        updated.row_version += 1;
        *stored = updated;
        Ok(())
    }

    async fn update(&self, refund: &RefundTransaction) -> Result<(), AppError> {
        let mut refunds = self.refunds.lock();
        let stored = refunds
            .get_mut(&refund.id.value())
            .ok_or_else(|| AppError::NotFound(format!("Refund {} not found", refund.id)))?;
        if stored.row_version != refund.row_version {
            return Err(AppError::ConcurrencyConflict(format!(
                "Refund {} version {} is stale",
                refund.id, refund.row_version
            )));
        }
        let mut updated = refund.clone();
        updated.row_version += 1;
        *stored = updated;
        Ok(())
    }

    async fn find_by_id(&self, id: RefundId) -> Result<Option<RefundTransaction>, AppError> {
        Ok(self.refunds.lock().get(&id.value()).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RefundTransaction>, AppError> {
        Ok(self
            .refunds
            .lock()
            .values()
            .find(|refund| refund.idempotency_key.value() == key)
            .cloned())
    }

    async fn completed_amount_for(&self, payment_id: TransactionId) -> Result<Decimal, AppError> {
        Ok(self
            .refunds
            .lock()
            .values()
            .filter(|refund| {
                refund.payment_transaction_id == payment_id
                    && refund.status
                        == crate::bounded_contexts::payment::domain::value_objects::RefundStatus::Completed
            })
            .map(|refund| refund.amount.value())
            .sum())
    }
}

pub struct InMemoryProviderRepository {
    providers: Mutex<Vec<PaymentProvider>>,
}

impl InMemoryProviderRepository {
    pub fn new(providers: Vec<PaymentProvider>) -> Self {
        Self {
            providers: Mutex::new(providers),
        }
    }
}

#[async_trait]
impl ProviderRepository for InMemoryProviderRepository {
    async fn find_routable_for_currency(
        &self,
        currency: &Currency,
    ) -> Result<Vec<PaymentProvider>, AppError> {
        let mut matching: Vec<PaymentProvider> = self
            .providers
            .lock()
            .iter()
            .filter(|p| p.is_routable() && p.supports_currency(currency))
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.priority);
        Ok(matching)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<PaymentProvider>, AppError> {
        Ok(self
            .providers
            .lock()
            .iter()
            .find(|p| p.name == name && p.deleted_at.is_none())
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentProvider>, AppError> {
        Ok(self.providers.lock().iter().find(|p| p.id == id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryWebhookEventRepository {
    events: Mutex<HashMap<Uuid, WebhookEvent>>,
}

impl InMemoryWebhookEventRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookEventRepository for InMemoryWebhookEventRepository {
    async fn insert(&self, event: &WebhookEvent) -> Result<WebhookInsertOutcome, AppError> {
        let mut events = self.events.lock();
        if let Some(existing) = events
            .values()
            .find(|e| e.provider_id == event.provider_id && e.provider_event_id == event.provider_event_id)
        {
            return Ok(WebhookInsertOutcome::Duplicate {
                existing_id: existing.id,
            });
        }
        events.insert(event.id, event.clone());
        Ok(WebhookInsertOutcome::Inserted)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>, AppError> {
        Ok(self.events.lock().get(&id).cloned())
    }

    async fn find_by_provider_event(
        &self,
        provider_id: Uuid,
        provider_event_id: &str,
    ) -> Result<Option<WebhookEvent>, AppError> {
        Ok(self
            .events
            .lock()
            .values()
            .find(|e| e.provider_id == provider_id && e.provider_event_id == provider_event_id)
            .cloned())
    }

    async fn update(&self, event: &WebhookEvent) -> Result<(), AppError> {
        let mut events = self.events.lock();
        let stored = events
            .get_mut(&event.id)
            .ok_or_else(|| AppError::NotFound(format!("Webhook event {} not found", event.id)))?;
        if stored.row_version != event.row_version {
            return Err(AppError::ConcurrencyConflict(format!(
                "Webhook event {} version {} is stale",
                event.id, event.row_version
            )));
        }
        let mut updated = event.clone();
        updated.row_version += 1;
        *stored = updated;
        Ok(())
    }

    async fn due_for_retry(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, AppError> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .events
            .lock()
            .values()
            .filter(|e| e.processing_status == WebhookProcessingStatus::Failed)
            .filter_map(|e| e.next_retry_at.filter(|at| *at <= now).map(|at| (at, e.id)))
            .collect();
        due.sort_by_key(|(at, _)| *at);
        Ok(due.into_iter().take(limit as usize).map(|(_, id)| id).collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|_, e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_contexts::payment::domain::value_objects::{
        Amount, IdempotencyKey, PaymentStatus,
    };
    use paygrid_types::CorrelationId;
    use rust_decimal_macros::dec;

    fn payment(key: &str) -> PaymentTransaction {
        PaymentTransaction::create(
            IdempotencyKey::new(key).unwrap(),
            Amount::new_payment(dec!(50.00), Currency::new("USD").unwrap()).unwrap(),
            "c1".to_string(),
            "o1".to_string(),
            Uuid::new_v4(),
            "stripe".to_string(),
            None,
            None,
            None,
            HashMap::new(),
            CorrelationId::new(),
        )
    }

    fn log_for(tx: &PaymentTransaction) -> TransactionLog {
        TransactionLog::record(
            tx.id,
            None,
            tx.status,
            "PaymentCreated",
            None,
            None,
            None,
            tx.correlation_id.clone(),
        )
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let repo = InMemoryPaymentRepository::new();
        let tx = payment("K1");
        repo.create(&tx, &log_for(&tx)).await.unwrap();

        let other = payment("K1");
        assert!(matches!(
            repo.create(&other, &log_for(&other)).await,
            Err(AppError::ConcurrencyConflict(_))
        ));
    }

    #[tokio::test]
    async fn stale_version_update_conflicts() {
        let repo = InMemoryPaymentRepository::new();
        let mut tx = payment("K1");
        repo.create(&tx, &log_for(&tx)).await.unwrap();

        tx.mark_processing("pi_1".to_string(), None).unwrap();
        repo.update(&tx, &log_for(&tx)).await.unwrap();

        // Same snapshot again: version is stale now
        let result = repo.update(&tx, &log_for(&tx)).await;
        assert!(matches!(result, Err(AppError::ConcurrencyConflict(_))));

        let fresh = repo.find_by_id(tx.id).await.unwrap().unwrap();
        assert_eq!(fresh.row_version, 1);
        assert_eq!(fresh.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn every_write_appends_exactly_one_log_row() {
        let repo = InMemoryPaymentRepository::new();
        let mut tx = payment("K1");
        repo.create(&tx, &log_for(&tx)).await.unwrap();

        tx.mark_processing("pi_1".to_string(), None).unwrap();
        repo.update(&tx, &log_for(&tx)).await.unwrap();

        let logs = repo.logs_for_payment(tx.id).await.unwrap();
        assert_eq!(logs.len(), 2);
    }

    #[tokio::test]
    async fn webhook_insert_detects_duplicates() {
        let repo = InMemoryWebhookEventRepository::new();
        let provider_id = Uuid::new_v4();

        let event = WebhookEvent::receive(
            provider_id,
            "evt_1".to_string(),
            "payment_intent.succeeded".to_string(),
            "{}".to_string(),
            None,
            None,
        );
        assert_eq!(repo.insert(&event).await.unwrap(), WebhookInsertOutcome::Inserted);

        let again = WebhookEvent::receive(
            provider_id,
            "evt_1".to_string(),
            "payment_intent.succeeded".to_string(),
            "{}".to_string(),
            None,
            None,
        );
        assert_eq!(
            repo.insert(&again).await.unwrap(),
            WebhookInsertOutcome::Duplicate {
                existing_id: event.id
            }
        );
    }
}
