use async_trait::async_trait;
use base64::Engine;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::shared::domain::errors::{AppError, ProviderError, ProviderErrorKind};

use super::{
    constant_time_eq, map_reqwest_error, ChargeOutcome, ChargeRequest, ProviderAdapter,
    RefundCallRequest, RefundOutcome, RemoteStatus, StatusOutcome, WebhookHeaders,
};

const DEFAULT_BASE_URL: &str = "https://api.omise.co";

/// Omise signs webhooks only when a signing secret is configured; otherwise
/// trust rests on the source-IP allowlist alone.
pub struct OmiseAdapter {
    secret_key: String,
    webhook_secret: Option<String>,
    ip_allowlist: Vec<String>,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OmiseCharge {
    id: String,
    status: String,
    #[serde(default)]
    authorize_uri: Option<String>,
}

impl OmiseAdapter {
    pub fn new(
        secret_key: String,
        webhook_secret: Option<String>,
        ip_allowlist: Vec<String>,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to build Omise client: {}", e)))?;

        Ok(Self {
            secret_key,
            webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
            ip_allowlist,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        })
    }

    fn to_subunits(amount: Decimal) -> Result<u64, ProviderError> {
        (amount * Decimal::from(100)).to_u64().ok_or_else(|| {
            ProviderError::new(
                "omise",
                ProviderErrorKind::InvalidRequest,
                format!("Amount {} cannot be expressed in subunits", amount),
            )
        })
    }

    fn map_charge_status(status: &str) -> RemoteStatus {
        match status {
            "successful" => RemoteStatus::Completed,
            "pending" => RemoteStatus::Processing,
            "failed" | "expired" | "reversed" => RemoteStatus::Failed,
            _ => RemoteStatus::Pending,
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        form: Option<&[(String, String)]>,
    ) -> Result<Value, ProviderError> {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.secret_key, Option::<&str>::None);
        if let Some(params) = form {
            builder = builder.form(params);
        }

        let response = builder.send().await.map_err(|e| map_reqwest_error("omise", e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("omise", e))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("omise", status, body));
        }

        serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                "omise",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed Omise response: {}", e),
            )
        })
    }
}

#[async_trait]
impl ProviderAdapter for OmiseAdapter {
    fn name(&self) -> &str {
        "omise"
    }

    async fn process_payment(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        let mut params = vec![
            ("amount".to_string(), Self::to_subunits(request.amount)?.to_string()),
            ("currency".to_string(), request.currency.to_lowercase()),
            ("metadata[transactionId]".to_string(), request.transaction_id.to_string()),
            ("metadata[orderId]".to_string(), request.order_id.clone()),
        ];
        if let Some(return_url) = &request.return_url {
            params.push(("return_uri".to_string(), return_url.clone()));
        }
        if let Some(description) = &request.description {
            params.push(("description".to_string(), description.clone()));
        }

        let raw = self
            .request(reqwest::Method::POST, "/charges", Some(&params))
            .await?;
        let charge: OmiseCharge = serde_json::from_value(raw.clone()).map_err(|e| {
            ProviderError::new(
                "omise",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed charge response: {}", e),
            )
        })?;

        Ok(ChargeOutcome {
            completed: Self::map_charge_status(&charge.status) == RemoteStatus::Completed,
            provider_transaction_id: charge.id,
            payment_url: charge.authorize_uri,
            raw_response: raw,
        })
    }

    async fn get_status(&self, provider_transaction_id: &str) -> Result<StatusOutcome, ProviderError> {
        let raw = self
            .request(
                reqwest::Method::GET,
                &format!("/charges/{}", provider_transaction_id),
                None,
            )
            .await?;

        let remote = raw
            .get("status")
            .and_then(|s| s.as_str())
            .map(Self::map_charge_status)
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
        let params = vec![(
            "amount".to_string(),
            Self::to_subunits(request.amount)?.to_string(),
        )];

        let raw = self
            .request(
                reqwest::Method::POST,
                &format!("/charges/{}/refunds", request.provider_transaction_id),
                Some(&params),
            )
            .await?;

        let refund_id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::new(
                    "omise",
                    ProviderErrorKind::ProviderInternal,
                    "Refund response carried no id",
                )
            })?
            .to_string();

        Ok(RefundOutcome {
            provider_refund_id: refund_id,
            raw_response: raw,
        })
    }

    async fn validate_webhook(
        &self,
        raw_payload: &str,
        headers: &WebhookHeaders,
        source_ip: Option<&str>,
    ) -> Result<bool, AppError> {
        if let Some(secret) = &self.webhook_secret {
            let signature = match headers.get("X-Omise-Signature") {
                Some(s) => s,
                None => return Ok(false),
            };
            let mac = hmac_sha256::HMAC::mac(raw_payload.as_bytes(), secret.as_bytes());
            let expected = base64::engine::general_purpose::STANDARD.encode(mac);
            return Ok(constant_time_eq(signature.as_bytes(), expected.as_bytes()));
        }

        match source_ip {
            Some(ip) => Ok(self.ip_allowlist.iter().any(|allowed| allowed == ip)),
            None => Ok(false),
        }
    }

    fn extract_event_id(&self, payload: &Value) -> Option<String> {
        payload
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter(secret: Option<&str>, allowlist: Vec<String>) -> OmiseAdapter {
        OmiseAdapter::new(
            "skey_test".to_string(),
            secret.map(|s| s.to_string()),
            allowlist,
            None,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn hmac_path_wins_when_secret_configured() {
        let adapter = adapter(Some("whsec"), vec![]);
        let payload = r#"{"id":"evnt_1","key":"charge.complete"}"#;

        let mac = hmac_sha256::HMAC::mac(payload.as_bytes(), b"whsec");
        let signature = base64::engine::general_purpose::STANDARD.encode(mac);

        let headers = WebhookHeaders::from([("X-Omise-Signature", signature.as_str())]);
        assert!(adapter.validate_webhook(payload, &headers, None).await.unwrap());

        let wrong = WebhookHeaders::from([("X-Omise-Signature", "bm90LXRoZS1tYWM=")]);
        assert!(!adapter.validate_webhook(payload, &wrong, None).await.unwrap());
    }

    #[tokio::test]
    async fn ip_allowlist_applies_without_secret() {
        let adapter = adapter(None, vec!["52.74.0.1".to_string()]);
        let headers = WebhookHeaders::new();

        assert!(adapter.validate_webhook("{}", &headers, Some("52.74.0.1")).await.unwrap());
        assert!(!adapter.validate_webhook("{}", &headers, Some("10.0.0.1")).await.unwrap());
        assert!(!adapter.validate_webhook("{}", &headers, None).await.unwrap());
    }

    #[test]
    fn subunit_conversion() {
        assert_eq!(OmiseAdapter::to_subunits(dec!(150.25)).unwrap(), 15025);
    }
}
