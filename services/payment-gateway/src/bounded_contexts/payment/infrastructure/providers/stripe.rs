use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::shared::domain::errors::{AppError, ProviderError, ProviderErrorKind};

use super::{
    constant_time_eq, hex_encode, map_reqwest_error, ChargeOutcome, ChargeRequest, ProviderAdapter,
    RefundCallRequest, RefundOutcome, RemoteStatus, StatusOutcome, WebhookHeaders,
};

const DEFAULT_BASE_URL: &str = "https://api.stripe.com/v1";
/// Webhooks older than this are replays and rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct StripeAdapter {
    api_key: String,
    webhook_secret: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    next_action: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
}

impl StripeAdapter {
    pub fn new(
        api_key: String,
        webhook_secret: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to build Stripe client: {}", e)))?;

        Ok(Self {
            api_key,
            webhook_secret,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        })
    }

    /// Stripe amounts are integer minor units.
    fn to_minor_units(amount: Decimal) -> Result<u64, ProviderError> {
        (amount * Decimal::from(100)).to_u64().ok_or_else(|| {
            ProviderError::new(
                "stripe",
                ProviderErrorKind::InvalidRequest,
                format!("Amount {} cannot be expressed in minor units", amount),
            )
        })
    }

    fn map_intent_status(status: &str) -> RemoteStatus {
        match status {
            "succeeded" => RemoteStatus::Completed,
            "processing" => RemoteStatus::Processing,
            "canceled" => RemoteStatus::Failed,
            _ => RemoteStatus::Pending,
        }
    }

    async fn post_form(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(params)
            .send()
            .await
            .map_err(|e| map_reqwest_error("stripe", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("stripe", e))?;

        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("stripe", status, body));
        }

        serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                "stripe",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed Stripe response: {}", e),
            )
        })
    }

    /// `Stripe-Signature: t=<unix>,v1=<hex hmac>` over `"{t}.{payload}"`.
    fn verify_signature(&self, payload: &str, header: &str) -> bool {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = match timestamp {
            Some(t) => t,
            None => return false,
        };
        if signatures.is_empty() {
            return false;
        }

        if (Utc::now().timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return false;
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let expected = hex_encode(&hmac_sha256::HMAC::mac(
            signed_payload.as_bytes(),
            self.webhook_secret.as_bytes(),
        ));

        signatures
            .iter()
            .any(|candidate| constant_time_eq(candidate.as_bytes(), expected.as_bytes()))
    }
}

#[async_trait]
impl ProviderAdapter for StripeAdapter {
    fn name(&self) -> &str {
        "stripe"
    }

    async fn process_payment(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        let mut params = vec![
            ("amount".to_string(), Self::to_minor_units(request.amount)?.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("metadata[transactionId]".to_string(), request.transaction_id.to_string()),
            ("metadata[orderId]".to_string(), request.order_id.clone()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];
        if let Some(description) = &request.description {
            params.push(("description".to_string(), description.clone()));
        }
        for (key, value) in &request.metadata {
            params.push((format!("metadata[{}]", key), value.clone()));
        }

        let raw = self.post_form("/payment_intents", &params).await?;
        let intent: StripePaymentIntent = serde_json::from_value(raw.clone()).map_err(|e| {
            ProviderError::new(
                "stripe",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed payment intent: {}", e),
            )
        })?;

        let payment_url = intent
            .next_action
            .as_ref()
            .and_then(|a| a.pointer("/redirect_to_url/url"))
            .and_then(|u| u.as_str())
            .map(|u| u.to_string());

        Ok(ChargeOutcome {
            completed: Self::map_intent_status(&intent.status) == RemoteStatus::Completed,
            provider_transaction_id: intent.id,
            payment_url,
            raw_response: raw,
        })
    }

    async fn get_status(&self, provider_transaction_id: &str) -> Result<StatusOutcome, ProviderError> {
        let response = self
            .client
            .get(format!("{}/payment_intents/{}", self.base_url, provider_transaction_id))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(|e| map_reqwest_error("stripe", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("stripe", e))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("stripe", status, body));
        }

        let raw: Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                "stripe",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed Stripe response: {}", e),
            )
        })?;
        let remote = raw
            .get("status")
            .and_then(|s| s.as_str())
            .map(Self::map_intent_status)
            .unwrap_or(RemoteStatus::Pending);

        Ok(StatusOutcome {
            status: remote,
            raw_response: raw,
        })
    }

    async fn process_refund(
        &self,
        request: &RefundCallRequest,
    ) -> Result<RefundOutcome, ProviderError> {
        let params = vec![
            ("payment_intent".to_string(), request.provider_transaction_id.clone()),
            ("amount".to_string(), Self::to_minor_units(request.amount)?.to_string()),
            ("metadata[refundId]".to_string(), request.refund_id.to_string()),
        ];

        let raw = self.post_form("/refunds", &params).await?;
        let refund: StripeRefund = serde_json::from_value(raw.clone()).map_err(|e| {
            ProviderError::new(
                "stripe",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed refund response: {}", e),
            )
        })?;

        if refund.status == "failed" {
            return Err(ProviderError::new(
                "stripe",
                ProviderErrorKind::InvalidRequest,
                format!("Stripe refund {} failed", refund.id),
            )
            .with_code("refund_failed"));
        }

        Ok(RefundOutcome {
            provider_refund_id: refund.id,
            raw_response: raw,
        })
    }

    async fn validate_webhook(
        &self,
        raw_payload: &str,
        headers: &WebhookHeaders,
        _source_ip: Option<&str>,
    ) -> Result<bool, AppError> {
        let header = match headers.get("Stripe-Signature") {
            Some(h) => h,
            None => return Ok(false),
        };
        Ok(self.verify_signature(raw_payload, header))
    }

    fn extract_event_id(&self, payload: &Value) -> Option<String> {
        payload
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
    }
}
