pub mod omise;
pub mod paypal;
pub mod router;
pub mod scb;
pub mod stripe;

pub use omise::OmiseAdapter;
pub use paypal::PayPalAdapter;
pub use router::{LatencyTracker, ProviderRouter};
pub use scb::ScbAdapter;
pub use stripe::StripeAdapter;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::domain::errors::{AppError, ProviderError};

/// Headers of an incoming webhook, looked up case-insensitively so adapters
/// stay independent of the HTTP layer's header representation.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders(HashMap<String, String>);

impl WebhookHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for WebhookHeaders {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.insert(name, value);
        }
        headers
    }
}

/// Normalized charge request handed to an adapter. The internal transaction
/// id travels in provider metadata so webhooks can find their way back.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub order_id: String,
    pub description: Option<String>,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub provider_transaction_id: String,
    pub payment_url: Option<String>,
    /// Provider reported synchronous completion.
    pub completed: bool,
    pub raw_response: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub status: RemoteStatus,
    pub raw_response: Value,
}

#[derive(Debug, Clone)]
pub struct RefundCallRequest {
    pub refund_id: Uuid,
    pub provider_transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub provider_refund_id: String,
    pub raw_response: Value,
}

/// Uniform capability facade over one external provider. The adapter is the
/// only component that speaks the provider dialect; everything upstream sees
/// these normalized types.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn process_payment(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError>;

    async fn get_status(&self, provider_transaction_id: &str) -> Result<StatusOutcome, ProviderError>;

    async fn process_refund(&self, request: &RefundCallRequest)
        -> Result<RefundOutcome, ProviderError>;

    async fn validate_webhook(
        &self,
        raw_payload: &str,
        headers: &WebhookHeaders,
        source_ip: Option<&str>,
    ) -> Result<bool, AppError>;

    /// Provider-specific natural key of a webhook event.
    fn extract_event_id(&self, payload: &Value) -> Option<String>;
}

/// Adapters keyed by provider name; the router and the webhook ingestor
/// resolve through this.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Comparison that does not leak the mismatch position through timing.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub(crate) fn map_reqwest_error(provider: &str, err: reqwest::Error) -> ProviderError {
    use crate::shared::domain::errors::ProviderErrorKind;

    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Network
    };
    ProviderError::new(provider, kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_headers_are_case_insensitive() {
        let headers = WebhookHeaders::from([("Stripe-Signature", "t=1,v1=abc")]);
        assert_eq!(headers.get("stripe-signature"), Some("t=1,v1=abc"));
        assert_eq!(headers.get("STRIPE-SIGNATURE"), Some("t=1,v1=abc"));
        assert_eq!(headers.get("X-Other"), None);
    }

    #[test]
    fn constant_time_eq_compares_content_and_length() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn hex_encoding_is_lowercase() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x0a]), "00ff0a");
    }
}
