use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use paygrid_types::CorrelationId;

use crate::shared::domain::errors::AppError;

use crate::bounded_contexts::payment::application::dto::{RefundRequest, SubmitPaymentRequest};
use crate::bounded_contexts::payment::infrastructure::providers::WebhookHeaders;

use super::routes::AppState;

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn error_response(error: AppError) -> Response {
    let status = StatusCode::from(&error);
    if status.is_server_error() {
        tracing::error!(error = %error, "request failed");
    }
    let body = ErrorBody {
        error: error.code(),
        message: match status.is_server_error() {
            // 5xx details stay in the logs
            true => "Internal error".to_string(),
            false => error.to_string(),
        },
    };
    (status, Json(body)).into_response()
}

fn correlation_from(headers: &HeaderMap) -> CorrelationId {
    CorrelationId::from_header(
        headers
            .get("X-Correlation-Id")
            .and_then(|v| v.to_str().ok()),
    )
}

fn idempotency_key_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.trim().is_empty())
}

fn webhook_headers_from(headers: &HeaderMap) -> WebhookHeaders {
    let mut converted = WebhookHeaders::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            converted.insert(name.as_str(), value);
        }
    }
    converted
}

pub async fn submit_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitPaymentRequest>,
) -> Response {
    let idempotency_key = match idempotency_key_from(&headers) {
        Some(key) => key,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "IDEMPOTENCY_KEY_REQUIRED",
                    message: "The Idempotency-Key header is required".to_string(),
                }),
            )
                .into_response();
        }
    };
    let correlation_id = correlation_from(&headers);

    match state
        .orchestrator
        .submit_payment(request, &idempotency_key, correlation_id)
        .await
    {
        Ok(response) => {
            let status = if response.duplicate {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(response)).into_response()
        }
        Err(error) => error_response(error),
    }
}

pub async fn get_payment(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> Response {
    match state.status.get_status(transaction_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => error_response(error),
    }
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<RefundRequest>,
) -> Response {
    let idempotency_key = match idempotency_key_from(&headers) {
        Some(key) => key,
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: "MISSING_IDEMPOTENCY_KEY",
                    message: "The Idempotency-Key header is required".to_string(),
                }),
            )
                .into_response();
        }
    };
    let correlation_id = correlation_from(&headers);

    match state
        .refunds
        .submit_refund(transaction_id, request, &idempotency_key, correlation_id)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(AppError::Validation(message)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "INVALID_REFUND",
                message,
            }),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let source_ip = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string());

    let webhook_headers = webhook_headers_from(&headers);

    match state
        .ingestor
        .ingest(&provider, &body, &webhook_headers, source_ip.as_deref())
        .await
    {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    database: bool,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let database = state.db.health_check().await.is_ok();
    let status = if database { "ok" } else { "degraded" };
    let code = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthBody { status, database })).into_response()
}
