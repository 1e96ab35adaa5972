use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::shared::domain::errors::{AppError, ProviderError, ProviderErrorKind};

use super::{
    constant_time_eq, hex_encode, map_reqwest_error, ChargeOutcome, ChargeRequest, ProviderAdapter,
    RefundCallRequest, RefundOutcome, RemoteStatus, StatusOutcome, WebhookHeaders,
};

const DEFAULT_BASE_URL: &str = "https://api-sandbox.partners.scb/partners/sandbox";

pub struct ScbAdapter {
    api_key: String,
    api_secret: String,
    webhook_secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl ScbAdapter {
    pub fn new(
        api_key: String,
        api_secret: String,
        webhook_secret: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to build SCB client: {}", e)))?;

        Ok(Self {
            api_key,
            api_secret,
            webhook_secret,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let request_id = Uuid::new_v4().to_string();
        let response = self
            .client
            .post(format!("{}/v1/oauth/token", self.base_url))
            .header("resourceOwnerId", &self.api_key)
            .header("requestUId", &request_id)
            .json(&json!({
                "applicationKey": self.api_key,
                "applicationSecret": self.api_secret,
            }))
            .send()
            .await
            .map_err(|e| map_reqwest_error("scb", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("scb", e))?;
        if status == 401 {
            return Err(ProviderError::new(
                "scb",
                ProviderErrorKind::Auth,
                "SCB rejected application credentials",
            ));
        }
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("scb", status, body));
        }

        let raw: Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                "scb",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed token response: {}", e),
            )
        })?;
        raw.pointer("/data/accessToken")
            .and_then(|v| v.as_str())
            .map(|t| t.to_string())
            .ok_or_else(|| {
                ProviderError::new(
                    "scb",
                    ProviderErrorKind::ProviderInternal,
                    "Token response carried no accessToken",
                )
            })
    }

    async fn post_authorized(&self, path: &str, body: Value) -> Result<Value, ProviderError> {
        let token = self.access_token().await?;
        let request_id = Uuid::new_v4().to_string();

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header("resourceOwnerId", &self.api_key)
            .header("requestUId", &request_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error("scb", e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("scb", e))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("scb", status, text));
        }

        serde_json::from_str(&text).map_err(|e| {
            ProviderError::new(
                "scb",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed SCB response: {}", e),
            )
        })
    }

    fn map_payment_status(status: &str) -> RemoteStatus {
        match status.to_ascii_uppercase().as_str() {
            "PAID" | "SUCCESS" | "COMPLETED" => RemoteStatus::Completed,
            "PENDING" | "PROCESSING" | "CREATED" => RemoteStatus::Processing,
            "FAILED" | "CANCELLED" | "EXPIRED" => RemoteStatus::Failed,
            _ => RemoteStatus::Pending,
        }
    }

    /// HMAC-SHA256 over `"{timestamp}|{request_id}|{payload}"`.
    fn compute_signature(&self, timestamp: &str, request_id: &str, payload: &str) -> String {
        let message = format!("{}|{}|{}", timestamp, request_id, payload);
        hex_encode(&hmac_sha256::HMAC::mac(
            message.as_bytes(),
            self.webhook_secret.as_bytes(),
        ))
    }
}

#[async_trait]
impl ProviderAdapter for ScbAdapter {
    fn name(&self) -> &str {
        "scb"
    }

    async fn process_payment(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        let body = json!({
            "transactionType": "PURCHASE",
            "transactionSubType": ["BP", "CCFA"],
            "sessionValidityPeriod": 1800,
            "billPayment": {
                "paymentAmount": request.amount,
                "ref1": request.order_id,
                "ref2": request.customer_id,
                "ref3": request.transaction_id.to_string(),
            },
            "merchantMetaData": {
                "callbackUrl": request.return_url,
                "extraData": {
                    "transactionId": request.transaction_id.to_string(),
                },
            },
        });

        let raw = self.post_authorized("/v1/deeplink/transactions", body).await?;

        let provider_transaction_id = raw
            .pointer("/data/transactionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::new(
                    "scb",
                    ProviderErrorKind::ProviderInternal,
                    "Deeplink response carried no transactionId",
                )
            })?
            .to_string();
        let payment_url = raw
            .pointer("/data/deeplinkUrl")
            .and_then(|v| v.as_str())
            .map(|u| u.to_string());

        Ok(ChargeOutcome {
            provider_transaction_id,
            payment_url,
            completed: false,
            raw_response: raw,
        })
    }

    async fn get_status(&self, provider_transaction_id: &str) -> Result<StatusOutcome, ProviderError> {
        let token = self.access_token().await?;
        let request_id = Uuid::new_v4().to_string();

        let response = self
            .client
            .get(format!(
                "{}/v1/deeplink/transactions/{}",
                self.base_url, provider_transaction_id
            ))
            .bearer_auth(token)
            .header("resourceOwnerId", &self.api_key)
            .header("requestUId", &request_id)
            .send()
            .await
            .map_err(|e| map_reqwest_error("scb", e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("scb", e))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("scb", status, text));
        }

        let raw: Value = serde_json::from_str(&text).map_err(|e| {
            ProviderError::new(
                "scb",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed SCB response: {}", e),
            )
        })?;
        let remote = raw
            .pointer("/data/statusCode")
            .and_then(|v| v.as_str())
            .or_else(|| raw.pointer("/data/status").and_then(|v| v.as_str()))
            .map(Self::map_payment_status)
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
        let body = json!({
            "originalTransactionId": request.provider_transaction_id,
            "refundAmount": request.amount,
            "refundRequestId": request.refund_id.to_string(),
            "reason": request.reason,
        });

        let raw = self.post_authorized("/v1/payment/refund", body).await?;

        let provider_refund_id = raw
            .pointer("/data/refundId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::new(
                    "scb",
                    ProviderErrorKind::ProviderInternal,
                    "Refund response carried no refundId",
                )
            })?
            .to_string();

        Ok(RefundOutcome {
            provider_refund_id,
            raw_response: raw,
        })
    }

    async fn validate_webhook(
        &self,
        raw_payload: &str,
        headers: &WebhookHeaders,
        _source_ip: Option<&str>,
    ) -> Result<bool, AppError> {
        let signature = headers.get("X-SCB-Signature");
        let timestamp = headers.get("X-SCB-Timestamp");
        let request_id = headers.get("X-SCB-Request-ID");

        let (signature, timestamp, request_id) = match (signature, timestamp, request_id) {
            (Some(s), Some(t), Some(r)) => (s, t, r),
            _ => return Ok(false),
        };

        let expected = self.compute_signature(timestamp, request_id, raw_payload);
        Ok(constant_time_eq(signature.as_bytes(), expected.as_bytes()))
    }

    fn extract_event_id(&self, payload: &Value) -> Option<String> {
        for field in ["eventId", "requestUId", "transactionId"] {
            if let Some(id) = payload.get(field).and_then(|v| v.as_str()) {
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> ScbAdapter {
        ScbAdapter::new(
            "app-key".to_string(),
            "app-secret".to_string(),
            "hook-secret".to_string(),
            None,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn signature_binds_timestamp_request_id_and_payload() {
        let adapter = adapter();
        let payload = r#"{"transactionId":"tx-1","statusCode":"PAID"}"#;
        let signature = adapter.compute_signature("1700000000", "req-1", payload);

        let headers = WebhookHeaders::from([
            ("X-SCB-Signature", signature.as_str()),
            ("X-SCB-Timestamp", "1700000000"),
            ("X-SCB-Request-ID", "req-1"),
        ]);
        assert!(adapter.validate_webhook(payload, &headers, None).await.unwrap());

        // Any component change invalidates the signature
        let shifted = WebhookHeaders::from([
            ("X-SCB-Signature", signature.as_str()),
            ("X-SCB-Timestamp", "1700000001"),
            ("X-SCB-Request-ID", "req-1"),
        ]);
        assert!(!adapter.validate_webhook(payload, &shifted, None).await.unwrap());
    }

    #[tokio::test]
    async fn missing_headers_fail_closed() {
        let adapter = adapter();
        let headers = WebhookHeaders::from([("X-SCB-Timestamp", "1700000000")]);
        assert!(!adapter.validate_webhook("{}", &headers, None).await.unwrap());
    }

    #[test]
    fn event_id_prefers_event_id_field() {
        let adapter = adapter();
        let payload = serde_json::json!({"eventId": "e1", "transactionId": "t1"});
        assert_eq!(adapter.extract_event_id(&payload), Some("e1".to_string()));

        let fallback = serde_json::json!({"transactionId": "t1"});
        assert_eq!(adapter.extract_event_id(&fallback), Some("t1".to_string()));
    }
}
