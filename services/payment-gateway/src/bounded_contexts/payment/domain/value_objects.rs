use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::shared::domain::errors::AppError;

/// Payment transaction ID Value Object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        Ok(Self(Uuid::parse_str(raw)?))
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Refund transaction ID Value Object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefundId(Uuid);

impl RefundId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn value(&self) -> Uuid {
        self.0
    }
}

impl Default for RefundId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RefundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-supplied key scoping at-most-once semantics per operation type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, AppError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Idempotency key cannot be empty".to_string()));
        }
        if trimmed.len() > 100 {
            return Err(AppError::Validation(
                "Idempotency key cannot exceed 100 characters".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn value(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scope of an idempotency key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Payment,
    Refund,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Payment => "payment",
            OperationType::Refund => "refund",
        }
    }
}

/// ISO-4217 currency code, canonicalized uppercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, AppError> {
        let code = raw.as_ref().trim().to_ascii_uppercase();
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AppError::Validation(format!(
                "Currency must be a three-letter ISO code, got '{}'",
                raw.as_ref()
            )));
        }
        Ok(Self(code))
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed-point monetary amount paired with its currency.
///
/// Payments carry two fractional digits, refunds up to four; both bounds are
/// enforced at the call sites that know which kind they hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amount {
    value: Decimal,
    currency: Currency,
}

impl Amount {
    pub fn new(value: Decimal, currency: Currency) -> Result<Self, AppError> {
        if value <= Decimal::ZERO {
            return Err(AppError::Validation("Amount must be positive".to_string()));
        }
        if value.scale() > 4 {
            return Err(AppError::Validation(
                "Amount cannot carry more than four fractional digits".to_string(),
            ));
        }
        Ok(Self { value, currency })
    }

    /// Payment amounts are constrained to two fractional digits.
    pub fn new_payment(value: Decimal, currency: Currency) -> Result<Self, AppError> {
        if value.scale() > 2 {
            return Err(AppError::Validation(
                "Payment amount cannot carry more than two fractional digits".to_string(),
            ));
        }
        Self::new(value, currency)
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn same_currency(&self, other: &Amount) -> bool {
        self.currency == other.currency
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// Payment lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    /// Terminal modulo refund-driven transitions out of Completed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Failed
                | PaymentStatus::Refunded
                | PaymentStatus::PartiallyRefunded
        )
    }

    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Refunded)
                | (Completed, PartiallyRefunded)
                | (PartiallyRefunded, Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "Pending",
            PaymentStatus::Processing => "Processing",
            PaymentStatus::Completed => "Completed",
            PaymentStatus::Failed => "Failed",
            PaymentStatus::Refunded => "Refunded",
            PaymentStatus::PartiallyRefunded => "PartiallyRefunded",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "Pending" => Ok(PaymentStatus::Pending),
            "Processing" => Ok(PaymentStatus::Processing),
            "Completed" => Ok(PaymentStatus::Completed),
            "Failed" => Ok(PaymentStatus::Failed),
            "Refunded" => Ok(PaymentStatus::Refunded),
            "PartiallyRefunded" => Ok(PaymentStatus::PartiallyRefunded),
            other => Err(AppError::Internal(format!("Unknown payment status '{}'", other))),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Refund lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefundStatus::Completed | RefundStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "Pending",
            RefundStatus::Processing => "Processing",
            RefundStatus::Completed => "Completed",
            RefundStatus::Failed => "Failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "Pending" => Ok(RefundStatus::Pending),
            "Processing" => Ok(RefundStatus::Processing),
            "Completed" => Ok(RefundStatus::Completed),
            "Failed" => Ok(RefundStatus::Failed),
            other => Err(AppError::Internal(format!("Unknown refund status '{}'", other))),
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundType {
    Full,
    Partial,
}

impl RefundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundType::Full => "full",
            RefundType::Partial => "partial",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "full" => Ok(RefundType::Full),
            "partial" => Ok(RefundType::Partial),
            other => Err(AppError::Validation(format!(
                "refund_type must be 'full' or 'partial', got '{}'",
                other
            ))),
        }
    }
}

/// Administrative status of a provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    Active,
    Inactive,
    Degraded,
    Maintenance,
    CircuitOpen,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderStatus::Active => "Active",
            ProviderStatus::Inactive => "Inactive",
            ProviderStatus::Degraded => "Degraded",
            ProviderStatus::Maintenance => "Maintenance",
            ProviderStatus::CircuitOpen => "CircuitOpen",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw {
            "Active" => Ok(ProviderStatus::Active),
            "Inactive" => Ok(ProviderStatus::Inactive),
            "Degraded" => Ok(ProviderStatus::Degraded),
            "Maintenance" => Ok(ProviderStatus::Maintenance),
            "CircuitOpen" => Ok(ProviderStatus::CircuitOpen),
            other => Err(AppError::Internal(format!("Unknown provider status '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn currency_is_canonicalized_uppercase() {
        let currency = Currency::new("usd").unwrap();
        assert_eq!(currency.code(), "USD");

        assert!(Currency::new("us").is_err());
        assert!(Currency::new("usdt").is_err());
        assert!(Currency::new("u5d").is_err());
    }

    #[test]
    fn amount_rejects_non_positive_values() {
        let usd = Currency::new("USD").unwrap();
        assert!(Amount::new(dec!(0), usd.clone()).is_err());
        assert!(Amount::new(dec!(-1.50), usd.clone()).is_err());
        assert!(Amount::new(dec!(99.99), usd).is_ok());
    }

    #[test]
    fn payment_amount_is_limited_to_two_fractional_digits() {
        let usd = Currency::new("USD").unwrap();
        assert!(Amount::new_payment(dec!(10.999), usd.clone()).is_err());
        assert!(Amount::new_payment(dec!(10.99), usd.clone()).is_ok());
        // Refund amounts may carry four
        assert!(Amount::new(dec!(10.9999), usd).is_ok());
    }

    #[test]
    fn idempotency_key_enforces_length() {
        assert!(IdempotencyKey::new("").is_err());
        assert!(IdempotencyKey::new("   ").is_err());
        assert!(IdempotencyKey::new("k".repeat(101)).is_err());
        assert!(IdempotencyKey::new("k".repeat(100)).is_ok());
    }

    #[test]
    fn payment_state_machine_allows_documented_transitions() {
        use PaymentStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Refunded));
        assert!(Completed.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(Refunded));
    }

    #[test]
    fn payment_state_machine_rejects_backwards_transitions() {
        use PaymentStatus::*;

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Refunded.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Refunded));
    }

    #[test]
    fn statuses_round_trip_through_strings() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
            PaymentStatus::PartiallyRefunded,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
