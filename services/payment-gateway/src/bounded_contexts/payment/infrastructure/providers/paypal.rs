use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::shared::domain::errors::{AppError, ProviderError, ProviderErrorKind};

use super::{
    map_reqwest_error, ChargeOutcome, ChargeRequest, ProviderAdapter, RefundCallRequest,
    RefundOutcome, RemoteStatus, StatusOutcome, WebhookHeaders,
};

const DEFAULT_BASE_URL: &str = "https://api-m.paypal.com";
/// Verification material is refreshed daily.
const TOKEN_CACHE: Duration = Duration::from_secs(24 * 3600);

pub struct PayPalAdapter {
    client_id: String,
    client_secret: String,
    /// Webhook id registered with PayPal; verification is bound to it.
    webhook_id: String,
    base_url: String,
    client: reqwest::Client,
    cached_token: Mutex<Option<(String, Instant)>>,
}

#[derive(Debug, Deserialize)]
struct OAuthResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    links: Vec<OrderLink>,
}

#[derive(Debug, Deserialize)]
struct OrderLink {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    verification_status: String,
}

impl PayPalAdapter {
    pub fn new(
        client_id: String,
        client_secret: String,
        webhook_id: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to build PayPal client: {}", e)))?;

        Ok(Self {
            client_id,
            client_secret,
            webhook_id,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
            cached_token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        if let Some((token, expires_at)) = self.cached_token.lock().clone() {
            if Instant::now() < expires_at {
                return Ok(token);
            }
        }

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| map_reqwest_error("paypal", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("paypal", e))?;
        if status == 401 {
            return Err(ProviderError::new(
                "paypal",
                ProviderErrorKind::Auth,
                "PayPal rejected client credentials",
            ));
        }
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("paypal", status, body));
        }

        let oauth: OAuthResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(
                "paypal",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed OAuth response: {}", e),
            )
        })?;

        let cache_for = Duration::from_secs(oauth.expires_in.max(60)).min(TOKEN_CACHE);
        *self.cached_token.lock() = Some((oauth.access_token.clone(), Instant::now() + cache_for));

        Ok(oauth.access_token)
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_reqwest_error("paypal", e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("paypal", e))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("paypal", status, text));
        }

        serde_json::from_str(&text).map_err(|e| {
            ProviderError::new(
                "paypal",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed PayPal response: {}", e),
            )
        })
    }

    fn map_order_status(status: &str) -> RemoteStatus {
        match status {
            "COMPLETED" => RemoteStatus::Completed,
            "APPROVED" | "SAVED" => RemoteStatus::Processing,
            "VOIDED" => RemoteStatus::Failed,
            _ => RemoteStatus::Pending,
        }
    }

    /// Certificates may only come from PayPal's own hosts.
    fn cert_url_is_trusted(cert_url: &str) -> bool {
        let host = cert_url
            .strip_prefix("https://")
            .and_then(|rest| rest.split('/').next());
        match host {
            Some(host) => host == "paypal.com" || host.ends_with(".paypal.com"),
            None => false,
        }
    }
}

#[async_trait]
impl ProviderAdapter for PayPalAdapter {
    fn name(&self) -> &str {
        "paypal"
    }

    async fn process_payment(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        let mut purchase_unit = json!({
            "reference_id": request.order_id,
            "custom_id": request.transaction_id.to_string(),
            "amount": {
                "currency_code": request.currency,
                "value": request.amount.to_string(),
            },
        });
        if let Some(description) = &request.description {
            purchase_unit["description"] = json!(description);
        }

        let mut body = json!({
            "intent": "CAPTURE",
            "purchase_units": [purchase_unit],
        });
        if request.return_url.is_some() || request.cancel_url.is_some() {
            body["payment_source"] = json!({
                "paypal": {
                    "experience_context": {
                        "return_url": request.return_url,
                        "cancel_url": request.cancel_url,
                    }
                }
            });
        }

        let raw = self.post_json("/v2/checkout/orders", body).await?;
        let order: OrderResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            ProviderError::new(
                "paypal",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed order response: {}", e),
            )
        })?;

        let payment_url = order
            .links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone());

        Ok(ChargeOutcome {
            completed: Self::map_order_status(&order.status) == RemoteStatus::Completed,
            provider_transaction_id: order.id,
            payment_url,
            raw_response: raw,
        })
    }

    async fn get_status(&self, provider_transaction_id: &str) -> Result<StatusOutcome, ProviderError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(format!(
                "{}/v2/checkout/orders/{}",
                self.base_url, provider_transaction_id
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| map_reqwest_error("paypal", e))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| map_reqwest_error("paypal", e))?;
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_http_status("paypal", status, text));
        }

        let raw: Value = serde_json::from_str(&text).map_err(|e| {
            ProviderError::new(
                "paypal",
                ProviderErrorKind::ProviderInternal,
                format!("Malformed PayPal response: {}", e),
            )
        })?;
        let remote = raw
            .get("status")
            .and_then(|s| s.as_str())
            .map(Self::map_order_status)
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
            "amount": {
                "currency_code": request.currency,
                "value": request.amount.to_string(),
            },
            "note_to_payer": request.reason,
        });

        let raw = self
            .post_json(
                &format!("/v2/payments/captures/{}/refund", request.provider_transaction_id),
                body,
            )
            .await?;

        let refund_id = raw
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::new(
                    "paypal",
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
        _source_ip: Option<&str>,
    ) -> Result<bool, AppError> {
        let transmission_id = headers.get("PAYPAL-TRANSMISSION-ID");
        let transmission_time = headers.get("PAYPAL-TRANSMISSION-TIME");
        let transmission_sig = headers.get("PAYPAL-TRANSMISSION-SIG");
        let cert_url = headers.get("PAYPAL-CERT-URL");
        let auth_algo = headers.get("PAYPAL-AUTH-ALGO");

        let (transmission_id, transmission_time, transmission_sig, cert_url, auth_algo) =
            match (transmission_id, transmission_time, transmission_sig, cert_url, auth_algo) {
                (Some(a), Some(b), Some(c), Some(d), Some(e)) => (a, b, c, d, e),
                _ => return Ok(false),
            };

        if !Self::cert_url_is_trusted(cert_url) {
            tracing::warn!(cert_url, "PayPal webhook carried untrusted cert URL");
            return Ok(false);
        }

        let event: Value = match serde_json::from_str(raw_payload) {
            Ok(v) => v,
            Err(_) => return Ok(false),
        };

        let body = json!({
            "transmission_id": transmission_id,
            "transmission_time": transmission_time,
            "transmission_sig": transmission_sig,
            "cert_url": cert_url,
            "auth_algo": auth_algo,
            "webhook_id": self.webhook_id,
            "webhook_event": event,
        });

        let raw = self
            .post_json("/v1/notifications/verify-webhook-signature", body)
            .await
            .map_err(AppError::Provider)?;

        let verification: VerificationResponse =
            serde_json::from_value(raw).map_err(|e| AppError::Serialization(e.to_string()))?;

        Ok(verification.verification_status == "SUCCESS")
    }

    fn extract_event_id(&self, payload: &Value) -> Option<String> {
        payload
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
    }
}
