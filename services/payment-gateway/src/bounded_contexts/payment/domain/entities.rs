use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use paygrid_types::CorrelationId;

use crate::shared::domain::errors::AppError;

use super::value_objects::{
    Amount, Currency, IdempotencyKey, PaymentStatus, ProviderStatus, RefundId, RefundStatus,
    RefundType, TransactionId,
};

/// The primary aggregate. Owned by the durable store; in-memory instances are
/// value snapshots and `row_version` is the version they were loaded at.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: TransactionId,
    pub idempotency_key: IdempotencyKey,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub customer_id: String,
    pub order_id: String,
    pub provider_id: Uuid,
    pub provider_name: String,
    pub provider_transaction_id: String,
    pub payment_url: Option<String>,
    pub description: Option<String>,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    pub metadata: HashMap<String, String>,
    pub error_message: Option<String>,
    pub provider_error_code: Option<String>,
    pub retry_count: i32,
    pub needs_reconciliation: bool,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub row_version: i64,
}

impl PaymentTransaction {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        idempotency_key: IdempotencyKey,
        amount: Amount,
        customer_id: String,
        order_id: String,
        provider_id: Uuid,
        provider_name: String,
        description: Option<String>,
        return_url: Option<String>,
        cancel_url: Option<String>,
        metadata: HashMap<String, String>,
        correlation_id: CorrelationId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            idempotency_key,
            amount,
            status: PaymentStatus::Pending,
            customer_id,
            order_id,
            provider_id,
            provider_name,
            provider_transaction_id: String::new(),
            payment_url: None,
            description,
            return_url,
            cancel_url,
            metadata,
            error_message: None,
            provider_error_code: None,
            retry_count: 0,
            needs_reconciliation: false,
            correlation_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
            row_version: 0,
        }
    }

    fn transition_to(&mut self, target: PaymentStatus) -> Result<PaymentStatus, AppError> {
        if !self.status.can_transition_to(target) {
            return Err(AppError::Validation(format!(
                "Illegal payment transition {} -> {}",
                self.status, target
            )));
        }
        let previous = self.status;
        self.status = target;
        self.updated_at = Utc::now();
        Ok(previous)
    }

    /// Provider accepted the charge asynchronously.
    pub fn mark_processing(
        &mut self,
        provider_transaction_id: String,
        payment_url: Option<String>,
    ) -> Result<PaymentStatus, AppError> {
        let previous = self.transition_to(PaymentStatus::Processing)?;
        self.provider_transaction_id = provider_transaction_id;
        self.payment_url = payment_url;
        Ok(previous)
    }

    pub fn mark_completed(
        &mut self,
        provider_transaction_id: Option<String>,
    ) -> Result<PaymentStatus, AppError> {
        let previous = self.transition_to(PaymentStatus::Completed)?;
        if let Some(id) = provider_transaction_id {
            self.provider_transaction_id = id;
        }
        self.completed_at = Some(Utc::now());
        Ok(previous)
    }

    pub fn mark_failed(
        &mut self,
        error_message: String,
        provider_error_code: Option<String>,
    ) -> Result<PaymentStatus, AppError> {
        let previous = self.transition_to(PaymentStatus::Failed)?;
        self.error_message = Some(error_message);
        self.provider_error_code = provider_error_code;
        Ok(previous)
    }

    /// Refund aggregate changed; `total_refunded` is the sum of completed
    /// refund amounts for this payment.
    pub fn apply_refund_total(&mut self, total_refunded: Decimal) -> Result<PaymentStatus, AppError> {
        if total_refunded > self.amount.value() {
            return Err(AppError::Validation(format!(
                "Refund total {} exceeds payment amount {}",
                total_refunded,
                self.amount.value()
            )));
        }
        let previous = self.status;
        if total_refunded == self.amount.value() {
            if self.status != PaymentStatus::Refunded {
                self.transition_to(PaymentStatus::Refunded)?;
            }
        } else if total_refunded > Decimal::ZERO && self.status == PaymentStatus::Completed {
            self.transition_to(PaymentStatus::PartiallyRefunded)?;
        } else {
            // Another partial refund while already PartiallyRefunded
            self.updated_at = Utc::now();
        }
        Ok(previous)
    }

    pub fn currency(&self) -> &Currency {
        self.amount.currency()
    }
}

/// A refund against a payment. Points at its parent; the parent's aggregate
/// refund state is query-computed, never a back-reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundTransaction {
    pub id: RefundId,
    pub idempotency_key: IdempotencyKey,
    pub payment_transaction_id: TransactionId,
    pub provider_id: Uuid,
    pub amount: Amount,
    pub status: RefundStatus,
    pub refund_type: RefundType,
    pub provider_refund_id: Option<String>,
    pub reason: Option<String>,
    pub error_message: Option<String>,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub row_version: i64,
}

impl RefundTransaction {
    pub fn create(
        idempotency_key: IdempotencyKey,
        payment_transaction_id: TransactionId,
        provider_id: Uuid,
        amount: Amount,
        refund_type: RefundType,
        reason: Option<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RefundId::new(),
            idempotency_key,
            payment_transaction_id,
            provider_id,
            amount,
            status: RefundStatus::Pending,
            refund_type,
            provider_refund_id: None,
            reason,
            error_message: None,
            correlation_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
            row_version: 0,
        }
    }

    pub fn mark_processing(&mut self) {
        self.status = RefundStatus::Processing;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, provider_refund_id: String) {
        self.status = RefundStatus::Completed;
        self.provider_refund_id = Some(provider_refund_id);
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, error_message: String) {
        self.status = RefundStatus::Failed;
        self.error_message = Some(error_message);
        self.updated_at = Utc::now();
    }
}

/// Read-mostly provider registration. `name` is the routing selector used by
/// webhooks and the breaker registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentProvider {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub status: ProviderStatus,
    pub supported_currencies: Vec<String>,
    pub priority: i32,
    pub credentials: HashMap<String, String>,
    pub configurations: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PaymentProvider {
    pub fn supports_currency(&self, currency: &Currency) -> bool {
        self.supported_currencies
            .iter()
            .any(|c| c.eq_ignore_ascii_case(currency.code()))
    }

    /// Soft-deleted providers never route.
    pub fn is_routable(&self) -> bool {
        self.deleted_at.is_none()
            && matches!(self.status, ProviderStatus::Active | ProviderStatus::Degraded)
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none() && self.status == ProviderStatus::Active
    }
}

/// Append-only audit entry, created in the same durable transaction as the
/// state change it records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionLog {
    pub id: Uuid,
    pub payment_transaction_id: TransactionId,
    pub previous_status: Option<PaymentStatus>,
    pub new_status: PaymentStatus,
    pub event_type: String,
    pub message: Option<String>,
    pub provider_response: Option<serde_json::Value>,
    pub error_details: Option<String>,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
}

impl TransactionLog {
    pub fn record(
        payment_transaction_id: TransactionId,
        previous_status: Option<PaymentStatus>,
        new_status: PaymentStatus,
        event_type: impl Into<String>,
        message: Option<String>,
        provider_response: Option<serde_json::Value>,
        error_details: Option<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_transaction_id,
            previous_status,
            new_status,
            event_type: event_type.into(),
            message,
            provider_response,
            error_details,
            correlation_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Duplicate,
}

impl WebhookProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookProcessingStatus::Pending => "Pending",
            WebhookProcessingStatus::Processing => "Processing",
            WebhookProcessingStatus::Completed => "Completed",
            WebhookProcessingStatus::Failed => "Failed",
            WebhookProcessingStatus::Duplicate => "Duplicate",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "Pending" => Ok(WebhookProcessingStatus::Pending),
            "Processing" => Ok(WebhookProcessingStatus::Processing),
            "Completed" => Ok(WebhookProcessingStatus::Completed),
            "Failed" => Ok(WebhookProcessingStatus::Failed),
            "Duplicate" => Ok(WebhookProcessingStatus::Duplicate),
            other => Err(AppError::Internal(format!(
                "Unknown webhook processing status '{}'",
                other
            ))),
        }
    }
}

/// Asynchronous provider notification, deduplicated by
/// `(provider_id, provider_event_id)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub raw_payload: String,
    pub parsed_payload: Option<serde_json::Value>,
    pub signature: Option<String>,
    pub signature_validated: bool,
    pub ip_address: Option<String>,
    pub processing_status: WebhookProcessingStatus,
    pub processing_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub payment_transaction_id: Option<TransactionId>,
    pub refund_transaction_id: Option<RefundId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub row_version: i64,
}

impl WebhookEvent {
    pub fn receive(
        provider_id: Uuid,
        provider_event_id: String,
        event_type: String,
        raw_payload: String,
        signature: Option<String>,
        ip_address: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            provider_id,
            provider_event_id,
            event_type,
            raw_payload,
            parsed_payload: None,
            signature,
            signature_validated: true,
            ip_address,
            processing_status: WebhookProcessingStatus::Pending,
            processing_attempts: 0,
            next_retry_at: None,
            failure_reason: None,
            payment_transaction_id: None,
            refund_transaction_id: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            row_version: 0,
        }
    }

    pub fn begin_processing(&mut self) {
        self.processing_status = WebhookProcessingStatus::Processing;
        self.processing_attempts += 1;
        self.next_retry_at = None;
        self.updated_at = Utc::now();
    }

    pub fn finish_processing(&mut self) {
        self.processing_status = WebhookProcessingStatus::Completed;
        self.processed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    pub fn fail_processing(&mut self, reason: String, next_retry_at: Option<DateTime<Utc>>) {
        self.processing_status = WebhookProcessingStatus::Failed;
        self.failure_reason = Some(reason);
        self.next_retry_at = next_retry_at;
        self.updated_at = Utc::now();
    }

    pub fn mark_duplicate(&mut self) {
        self.processing_status = WebhookProcessingStatus::Duplicate;
        self.processed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn payment() -> PaymentTransaction {
        PaymentTransaction::create(
            IdempotencyKey::new("key-1").unwrap(),
            Amount::new_payment(dec!(100.00), Currency::new("USD").unwrap()).unwrap(),
            "cust-1".to_string(),
            "order-1".to_string(),
            Uuid::new_v4(),
            "stripe".to_string(),
            None,
            None,
            None,
            HashMap::new(),
            CorrelationId::new(),
        )
    }

    #[test]
    fn payment_starts_pending_with_empty_provider_reference() {
        let tx = payment();
        assert_eq!(tx.status, PaymentStatus::Pending);
        assert_eq!(tx.provider_transaction_id, "");
        assert_eq!(tx.retry_count, 0);
        assert_eq!(tx.row_version, 0);
    }

    #[test]
    fn processing_then_completed_records_previous_statuses() {
        let mut tx = payment();

        let prev = tx.mark_processing("pi_123".to_string(), None).unwrap();
        assert_eq!(prev, PaymentStatus::Pending);
        assert_eq!(tx.status, PaymentStatus::Processing);

        let prev = tx.mark_completed(None).unwrap();
        assert_eq!(prev, PaymentStatus::Processing);
        assert!(tx.completed_at.is_some());
    }

    #[test]
    fn failed_payment_cannot_complete() {
        let mut tx = payment();
        tx.mark_failed("card declined".to_string(), Some("card_declined".to_string()))
            .unwrap();

        assert!(tx.mark_completed(None).is_err());
        assert!(tx.mark_processing("pi_1".to_string(), None).is_err());
    }

    #[test]
    fn refund_totals_drive_partial_then_full_refund() {
        let mut tx = payment();
        tx.mark_processing("pi_123".to_string(), None).unwrap();
        tx.mark_completed(None).unwrap();

        tx.apply_refund_total(dec!(30.00)).unwrap();
        assert_eq!(tx.status, PaymentStatus::PartiallyRefunded);

        // Second partial refund keeps the status
        tx.apply_refund_total(dec!(60.00)).unwrap();
        assert_eq!(tx.status, PaymentStatus::PartiallyRefunded);

        tx.apply_refund_total(dec!(100.00)).unwrap();
        assert_eq!(tx.status, PaymentStatus::Refunded);
    }

    #[test]
    fn refund_total_above_amount_is_rejected() {
        let mut tx = payment();
        tx.mark_processing("pi_123".to_string(), None).unwrap();
        tx.mark_completed(None).unwrap();

        assert!(tx.apply_refund_total(dec!(100.01)).is_err());
    }

    #[test]
    fn webhook_event_retry_bookkeeping() {
        let mut event = WebhookEvent::receive(
            Uuid::new_v4(),
            "evt_1".to_string(),
            "payment_intent.succeeded".to_string(),
            "{}".to_string(),
            Some("sig".to_string()),
            None,
        );

        event.begin_processing();
        assert_eq!(event.processing_attempts, 1);
        assert_eq!(event.processing_status, WebhookProcessingStatus::Processing);

        let retry_at = Utc::now() + chrono::Duration::minutes(1);
        event.fail_processing("no transaction".to_string(), Some(retry_at));
        assert_eq!(event.processing_status, WebhookProcessingStatus::Failed);
        assert_eq!(event.next_retry_at, Some(retry_at));

        event.begin_processing();
        assert_eq!(event.processing_attempts, 2);
        assert!(event.next_retry_at.is_none());

        event.finish_processing();
        assert!(event.processed_at.is_some());
    }
}
