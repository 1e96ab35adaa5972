use serde::{Deserialize, Serialize};
use serde_json::json;

use paygrid_types::{CorrelationId, EventEnvelope};

use crate::shared::domain::events::{DomainEvent, EventMetadata};

use super::entities::{PaymentTransaction, RefundTransaction};

/// Payment lifecycle event, published for Created/Completed/Failed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentLifecycleEvent {
    pub metadata: EventMetadata,
    pub transaction_id: String,
    pub idempotency_key: String,
    pub amount: rust_decimal::Decimal,
    pub currency: String,
    pub customer_id: String,
    pub order_id: String,
    pub provider_name: String,
    pub provider_transaction_id: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
}

pub const PAYMENT_CREATED: &str = "payment.created";
pub const PAYMENT_COMPLETED: &str = "payment.completed";
pub const PAYMENT_FAILED: &str = "payment.failed";

impl PaymentLifecycleEvent {
    fn from_transaction(event_type: &str, tx: &PaymentTransaction) -> Self {
        Self {
            metadata: EventMetadata::for_aggregate(
                event_type,
                tx.id.value(),
                "PaymentTransaction",
                tx.correlation_id.clone(),
            ),
            transaction_id: tx.id.to_string(),
            idempotency_key: tx.idempotency_key.value().to_string(),
            amount: tx.amount.value(),
            currency: tx.amount.currency().code().to_string(),
            customer_id: tx.customer_id.clone(),
            order_id: tx.order_id.clone(),
            provider_name: tx.provider_name.clone(),
            provider_transaction_id: if tx.provider_transaction_id.is_empty() {
                None
            } else {
                Some(tx.provider_transaction_id.clone())
            },
            error_message: tx.error_message.clone(),
            error_code: tx.provider_error_code.clone(),
        }
    }

    pub fn created(tx: &PaymentTransaction) -> Self {
        Self::from_transaction(PAYMENT_CREATED, tx)
    }

    pub fn completed(tx: &PaymentTransaction) -> Self {
        Self::from_transaction(PAYMENT_COMPLETED, tx)
    }

    pub fn failed(tx: &PaymentTransaction) -> Self {
        Self::from_transaction(PAYMENT_FAILED, tx)
    }
}

impl DomainEvent for PaymentLifecycleEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_data(&self) -> serde_json::Value {
        json!({
            "event_id": self.metadata.event_id,
            "transaction_id": self.transaction_id,
            "idempotency_key": self.idempotency_key,
            "amount": self.amount,
            "currency": self.currency,
            "customer_id": self.customer_id,
            "order_id": self.order_id,
            "provider_name": self.provider_name,
            "provider_transaction_id": self.provider_transaction_id,
            "timestamp": self.metadata.occurred_at,
            "error_message": self.error_message,
            "error_code": self.error_code,
            "correlation_id": self.metadata.correlation_id,
        })
    }
}

/// Refund lifecycle event, published for Initiated/Completed/Failed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundLifecycleEvent {
    pub metadata: EventMetadata,
    pub refund_id: String,
    pub payment_transaction_id: String,
    pub idempotency_key: String,
    pub amount: rust_decimal::Decimal,
    pub currency: String,
    pub provider_name: String,
    pub provider_refund_id: Option<String>,
    pub error_message: Option<String>,
}

pub const REFUND_INITIATED: &str = "refund.initiated";
pub const REFUND_COMPLETED: &str = "refund.completed";
pub const REFUND_FAILED: &str = "refund.failed";

impl RefundLifecycleEvent {
    fn from_refund(event_type: &str, refund: &RefundTransaction, provider_name: &str) -> Self {
        Self {
            metadata: EventMetadata::for_aggregate(
                event_type,
                refund.id.value(),
                "RefundTransaction",
                refund.correlation_id.clone(),
            ),
            refund_id: refund.id.to_string(),
            payment_transaction_id: refund.payment_transaction_id.to_string(),
            idempotency_key: refund.idempotency_key.value().to_string(),
            amount: refund.amount.value(),
            currency: refund.amount.currency().code().to_string(),
            provider_name: provider_name.to_string(),
            provider_refund_id: refund.provider_refund_id.clone(),
            error_message: refund.error_message.clone(),
        }
    }

    pub fn initiated(refund: &RefundTransaction, provider_name: &str) -> Self {
        Self::from_refund(REFUND_INITIATED, refund, provider_name)
    }

    pub fn completed(refund: &RefundTransaction, provider_name: &str) -> Self {
        Self::from_refund(REFUND_COMPLETED, refund, provider_name)
    }

    pub fn failed(refund: &RefundTransaction, provider_name: &str) -> Self {
        Self::from_refund(REFUND_FAILED, refund, provider_name)
    }
}

impl DomainEvent for RefundLifecycleEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_data(&self) -> serde_json::Value {
        json!({
            "event_id": self.metadata.event_id,
            "refund_id": self.refund_id,
            "payment_transaction_id": self.payment_transaction_id,
            "idempotency_key": self.idempotency_key,
            "amount": self.amount,
            "currency": self.currency,
            "provider_name": self.provider_name,
            "provider_refund_id": self.provider_refund_id,
            "timestamp": self.metadata.occurred_at,
            "error_message": self.error_message,
            "correlation_id": self.metadata.correlation_id,
        })
    }
}

pub const PROVIDER_DEGRADED: &str = "provider.degraded";
pub const PROVIDER_RECOVERED: &str = "provider.recovered";

/// Breaker-driven provider health change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderHealthEvent {
    pub metadata: EventMetadata,
    pub provider_name: String,
    pub state: String,
    pub reason: String,
}

impl ProviderHealthEvent {
    pub fn degraded(provider_name: &str, state: &str, reason: &str) -> Self {
        Self::build(PROVIDER_DEGRADED, provider_name, state, reason)
    }

    pub fn recovered(provider_name: &str, state: &str, reason: &str) -> Self {
        Self::build(PROVIDER_RECOVERED, provider_name, state, reason)
    }

    fn build(event_type: &str, provider_name: &str, state: &str, reason: &str) -> Self {
        Self {
            metadata: EventMetadata::for_aggregate(
                event_type,
                uuid::Uuid::new_v4(),
                "PaymentProvider",
                CorrelationId::new(),
            ),
            provider_name: provider_name.to_string(),
            state: state.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl DomainEvent for ProviderHealthEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_data(&self) -> serde_json::Value {
        json!({
            "provider_name": self.provider_name,
            "state": self.state,
            "reason": self.reason,
            "timestamp": self.metadata.occurred_at,
        })
    }
}

pub const RECONCILIATION_DISCREPANCY: &str = "reconciliation.discrepancy";

/// Emitted by the reconciliation job when provider records and local rows
/// disagree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconciliationDiscrepancyEvent {
    pub metadata: EventMetadata,
    pub transaction_id: String,
    pub provider_name: String,
    pub local_status: String,
    pub provider_status: Option<String>,
    pub detail: String,
}

impl ReconciliationDiscrepancyEvent {
    pub fn new(
        tx: &PaymentTransaction,
        provider_status: Option<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            metadata: EventMetadata::for_aggregate(
                RECONCILIATION_DISCREPANCY,
                tx.id.value(),
                "PaymentTransaction",
                tx.correlation_id.clone(),
            ),
            transaction_id: tx.id.to_string(),
            provider_name: tx.provider_name.clone(),
            local_status: tx.status.to_string(),
            provider_status,
            detail: detail.into(),
        }
    }
}

impl DomainEvent for ReconciliationDiscrepancyEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    fn event_data(&self) -> serde_json::Value {
        json!({
            "transaction_id": self.transaction_id,
            "provider_name": self.provider_name,
            "local_status": self.local_status,
            "provider_status": self.provider_status,
            "detail": self.detail,
            "timestamp": self.metadata.occurred_at,
        })
    }
}

/// Wraps any domain event into the bus envelope.
pub fn to_envelope(event: &dyn DomainEvent) -> EventEnvelope {
    EventEnvelope::new(
        event.event_type(),
        event.event_data(),
        event.metadata().correlation_id.clone(),
    )
}
