use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::shared::domain::errors::AppError;

use super::entities::PaymentTransaction;
use super::value_objects::{Amount, PaymentStatus, RefundType};

/// Status a webhook event resolves to before the refund aggregate is
/// consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookTarget {
    Completed,
    Failed,
    Processing,
    /// Refund-driven; the processor recomputes the refund aggregate instead
    /// of trusting the event name.
    Refunded,
}

/// Maps a provider event name onto a target status by substring on the
/// lowercased name. Unknown names resolve to Processing, the conservative
/// choice.
pub fn map_event_to_target(event_type: &str) -> WebhookTarget {
    let name = event_type.to_lowercase();

    if ["completed", "succeeded", "success"].iter().any(|k| name.contains(k)) {
        return WebhookTarget::Completed;
    }
    // "cancel" covers both cancelled and canceled spellings
    if ["failed", "failure", "declined", "cancel"].iter().any(|k| name.contains(k)) {
        return WebhookTarget::Failed;
    }
    if ["pending", "processing"].iter().any(|k| name.contains(k)) {
        return WebhookTarget::Processing;
    }
    if name.contains("refunded") {
        return WebhookTarget::Refunded;
    }
    WebhookTarget::Processing
}

const ID_FIELDS: [&str; 5] = [
    "transactionId",
    "transaction_id",
    "paymentId",
    "payment_id",
    "id",
];

fn candidate_objects(payload: &Value) -> Vec<&Value> {
    let mut objects = vec![payload];
    for path in [
        &["metadata"][..],
        &["data"][..],
        &["data", "metadata"][..],
        &["data", "object"][..],
        &["data", "object", "metadata"][..],
    ] {
        let mut cursor = payload;
        let mut ok = true;
        for segment in path {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            objects.push(cursor);
        }
    }
    objects
}

/// Searches the conventional fields for the internal transaction id; the
/// first value that parses as a UUID wins. Provider-native ids (e.g. Stripe
/// event ids) fail the parse and are skipped.
pub fn extract_transaction_id(payload: &Value) -> Option<Uuid> {
    for object in candidate_objects(payload) {
        for field in ID_FIELDS {
            if let Some(raw) = object.get(field).and_then(|v| v.as_str()) {
                if let Ok(id) = Uuid::parse_str(raw) {
                    return Some(id);
                }
            }
        }
    }
    None
}

/// Amount still refundable on a payment.
pub fn refundable_remaining(parent: &PaymentTransaction, completed_total: Decimal) -> Decimal {
    parent.amount.value() - completed_total
}

/// Refund admission rules: parent refundable, positive amount within the
/// remainder, currency match, and the declared type consistent with the
/// remainder.
pub fn validate_refund(
    parent: &PaymentTransaction,
    completed_total: Decimal,
    amount: &Amount,
    refund_type: RefundType,
) -> Result<(), AppError> {
    if !matches!(
        parent.status,
        PaymentStatus::Completed | PaymentStatus::PartiallyRefunded
    ) {
        return Err(AppError::Validation(format!(
            "Payment {} is not refundable in status {}",
            parent.id, parent.status
        )));
    }

    if amount.currency() != parent.amount.currency() {
        return Err(AppError::Validation(format!(
            "Refund currency {} does not match payment currency {}",
            amount.currency(),
            parent.amount.currency()
        )));
    }

    let remaining = refundable_remaining(parent, completed_total);
    if amount.value() > remaining {
        return Err(AppError::Validation(format!(
            "Refund amount {} exceeds refundable remainder {}",
            amount.value(),
            remaining
        )));
    }

    let is_full = amount.value() == remaining;
    match refund_type {
        RefundType::Full if !is_full => Err(AppError::Validation(
            "refund_type 'full' requires the amount to equal the refundable remainder".to_string(),
        )),
        RefundType::Partial if is_full => Err(AppError::Validation(
            "refund_type 'partial' cannot consume the entire refundable remainder".to_string(),
        )),
        _ => Ok(()),
    }
}
