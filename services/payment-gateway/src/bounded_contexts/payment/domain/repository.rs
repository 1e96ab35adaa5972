use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::shared::domain::errors::AppError;

use super::entities::{
    PaymentProvider, PaymentTransaction, RefundTransaction, TransactionLog, WebhookEvent,
};
use super::value_objects::{Currency, RefundId, TransactionId};

/// Storage port for the payment aggregate.
///
/// Every state change travels with its audit log entry and both land in one
/// durable transaction. `update` enforces the optimistic `row_version`: the
/// entity carries the version it was loaded at, a mismatch is a
/// `ConcurrencyConflict`.
#[async_trait]
pub trait PaymentTransactionRepository: Send + Sync {
    async fn create(&self, tx: &PaymentTransaction, log: &TransactionLog) -> Result<(), AppError>;

    async fn update(&self, tx: &PaymentTransaction, log: &TransactionLog) -> Result<(), AppError>;

    async fn find_by_id(&self, id: TransactionId) -> Result<Option<PaymentTransaction>, AppError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<PaymentTransaction>, AppError>;

    /// Best-effort inconsistency marker for crashes between provider call and
    /// persistence; the reconciliation job scans these.
    async fn mark_needs_reconciliation(&self, id: TransactionId) -> Result<(), AppError>;

    async fn find_needing_reconciliation(
        &self,
        limit: i64,
    ) -> Result<Vec<PaymentTransaction>, AppError>;

    async fn logs_for_payment(&self, id: TransactionId) -> Result<Vec<TransactionLog>, AppError>;
}

#[async_trait]
pub trait RefundTransactionRepository: Send + Sync {
    async fn create(&self, refund: &RefundTransaction, log: &TransactionLog) -> Result<(), AppError>;

    /// Persists the refund outcome together with the parent's refund-driven
    /// status change and the audit entry, atomically. Both row versions are
    /// checked.
    async fn update_with_parent(
        &self,
        refund: &RefundTransaction,
        parent: &PaymentTransaction,
        log: &TransactionLog,
    ) -> Result<(), AppError>;

    async fn update(&self, refund: &RefundTransaction) -> Result<(), AppError>;

    async fn find_by_id(&self, id: RefundId) -> Result<Option<RefundTransaction>, AppError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RefundTransaction>, AppError>;

    /// Σ amount of Completed refunds for the given parent.
    async fn completed_amount_for(&self, payment_id: TransactionId) -> Result<Decimal, AppError>;
}

#[async_trait]
pub trait ProviderRepository: Send + Sync {
    /// Routable (non-deleted, Active or Degraded) providers supporting the
    /// currency, ordered by priority ascending.
    async fn find_routable_for_currency(
        &self,
        currency: &Currency,
    ) -> Result<Vec<PaymentProvider>, AppError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<PaymentProvider>, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentProvider>, AppError>;
}

/// Outcome of a webhook insert attempt; the unique
/// `(provider_id, provider_event_id)` constraint resolves races.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookInsertOutcome {
    Inserted,
    Duplicate { existing_id: Uuid },
}

#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    async fn insert(&self, event: &WebhookEvent) -> Result<WebhookInsertOutcome, AppError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<WebhookEvent>, AppError>;

    async fn find_by_provider_event(
        &self,
        provider_id: Uuid,
        provider_event_id: &str,
    ) -> Result<Option<WebhookEvent>, AppError>;

    /// Optimistic update on `row_version`.
    async fn update(&self, event: &WebhookEvent) -> Result<(), AppError>;

    /// Failed events whose `next_retry_at` has passed.
    async fn due_for_retry(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>, AppError>;

    /// Retention cleanup hook; the scheduled job that calls it lives outside
    /// this service.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}
