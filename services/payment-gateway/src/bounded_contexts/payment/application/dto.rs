use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use paygrid_types::CorrelationId;

use crate::shared::domain::errors::AppError;

use crate::bounded_contexts::payment::domain::entities::{PaymentTransaction, RefundTransaction};
use crate::bounded_contexts::payment::domain::value_objects::{
    Amount, Currency, IdempotencyKey, PaymentStatus, RefundType,
};

/// Caller-facing payment submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitPaymentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub order_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub preferred_provider: Option<String>,
}

/// Submission inputs after validation; currency canonicalized, key bounded.
#[derive(Debug, Clone)]
pub struct ValidatedPayment {
    pub idempotency_key: IdempotencyKey,
    pub amount: Amount,
    pub customer_id: String,
    pub order_id: String,
    pub description: Option<String>,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    pub metadata: HashMap<String, String>,
    pub preferred_provider: Option<String>,
    pub correlation_id: CorrelationId,
}

impl SubmitPaymentRequest {
    pub fn validate(
        self,
        idempotency_key: &str,
        correlation_id: CorrelationId,
    ) -> Result<ValidatedPayment, AppError> {
        let idempotency_key = IdempotencyKey::new(idempotency_key)?;
        let currency = Currency::new(&self.currency)?;
        let amount = Amount::new_payment(self.amount, currency)?;

        if self.customer_id.trim().is_empty() {
            return Err(AppError::Validation("customer_id cannot be empty".to_string()));
        }
        if self.order_id.trim().is_empty() {
            return Err(AppError::Validation("order_id cannot be empty".to_string()));
        }

        Ok(ValidatedPayment {
            idempotency_key,
            amount,
            customer_id: self.customer_id.trim().to_string(),
            order_id: self.order_id.trim().to_string(),
            description: self.description,
            return_url: self.return_url,
            cancel_url: self.cancel_url,
            metadata: self.metadata,
            preferred_provider: self.preferred_provider,
            correlation_id,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    pub amount: Decimal,
    #[serde(default)]
    pub reason: Option<String>,
    pub refund_type: String,
}

#[derive(Debug, Clone)]
pub struct ValidatedRefund {
    pub idempotency_key: IdempotencyKey,
    pub payment_transaction_id: Uuid,
    pub amount: Decimal,
    pub reason: Option<String>,
    pub refund_type: RefundType,
    pub correlation_id: CorrelationId,
}

impl RefundRequest {
    pub fn validate(
        self,
        payment_transaction_id: Uuid,
        idempotency_key: &str,
        correlation_id: CorrelationId,
    ) -> Result<ValidatedRefund, AppError> {
        if self.amount <= Decimal::ZERO {
            return Err(AppError::Validation("Refund amount must be positive".to_string()));
        }
        if self.amount.scale() > 4 {
            return Err(AppError::Validation(
                "Refund amount cannot carry more than four fractional digits".to_string(),
            ));
        }
        Ok(ValidatedRefund {
            idempotency_key: IdempotencyKey::new(idempotency_key)?,
            payment_transaction_id,
            amount: self.amount,
            reason: self.reason,
            refund_type: RefundType::parse(&self.refund_type)?,
            correlation_id,
        })
    }
}

/// Caller-facing view of a payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentResponse {
    pub transaction_id: Uuid,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub provider_name: String,
    pub provider_transaction_id: Option<String>,
    pub payment_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// True when this request replayed an earlier submission.
    pub duplicate: bool,
}

impl PaymentResponse {
    pub fn from_transaction(tx: &PaymentTransaction, duplicate: bool) -> Self {
        Self {
            transaction_id: tx.id.value(),
            status: tx.status,
            amount: tx.amount.value(),
            currency: tx.amount.currency().code().to_string(),
            provider_name: tx.provider_name.clone(),
            provider_transaction_id: if tx.provider_transaction_id.is_empty() {
                None
            } else {
                Some(tx.provider_transaction_id.clone())
            },
            payment_url: tx.payment_url.clone(),
            error_message: tx.error_message.clone(),
            created_at: tx.created_at,
            duplicate,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResponse {
    pub refund_id: Uuid,
    pub payment_transaction_id: Uuid,
    pub status: String,
    pub amount: Decimal,
    pub currency: String,
    pub refund_type: String,
    pub provider_refund_id: Option<String>,
    pub error_message: Option<String>,
    pub duplicate: bool,
}

impl RefundResponse {
    pub fn from_refund(refund: &RefundTransaction, duplicate: bool) -> Self {
        Self {
            refund_id: refund.id.value(),
            payment_transaction_id: refund.payment_transaction_id.value(),
            status: refund.status.as_str().to_string(),
            amount: refund.amount.value(),
            currency: refund.amount.currency().code().to_string(),
            refund_type: refund.refund_type.as_str().to_string(),
            provider_refund_id: refund.provider_refund_id.clone(),
            error_message: refund.error_message.clone(),
            duplicate,
        }
    }
}

/// Narrow status projection — the only shape the status cache stores, so the
/// cache format stays decoupled from the entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStatusView {
    pub transaction_id: Uuid,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub provider_name: String,
    pub provider_transaction_id: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentStatusView {
    pub fn from_transaction(tx: &PaymentTransaction) -> Self {
        Self {
            transaction_id: tx.id.value(),
            status: tx.status,
            amount: tx.amount.value(),
            currency: tx.amount.currency().code().to_string(),
            provider_name: tx.provider_name.clone(),
            provider_transaction_id: if tx.provider_transaction_id.is_empty() {
                None
            } else {
                Some(tx.provider_transaction_id.clone())
            },
            error_message: tx.error_message.clone(),
            updated_at: tx.updated_at,
            completed_at: tx.completed_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Acknowledgement returned to the webhook caller.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub event_id: Uuid,
    pub accepted: bool,
    pub duplicate: bool,
}
