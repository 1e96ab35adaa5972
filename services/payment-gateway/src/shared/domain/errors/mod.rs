use axum::http::StatusCode;

/// Category of a provider-side failure.
///
/// `Auth` and `InvalidRequest` are never retried; the other kinds are
/// transient and eligible for retry inside the resilience pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Network,
    Timeout,
    RateLimited,
    Auth,
    InvalidRequest,
    ProviderInternal,
}

impl ProviderErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Network
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::ProviderInternal
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::InvalidRequest => "invalid_request",
            ProviderErrorKind::ProviderInternal => "provider_internal",
        };
        write!(f, "{}", name)
    }
}

/// Normalized failure returned by provider adapters.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub code: Option<String>,
    pub message: String,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Classify an HTTP status the way the retry policy expects: 408/429 and
    /// 5xx are transient, other 4xx are caller mistakes.
    pub fn from_http_status(provider: &str, status: u16, body: String) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            400..=499 => ProviderErrorKind::InvalidRequest,
            _ => ProviderErrorKind::ProviderInternal,
        };
        Self {
            provider: provider.to_string(),
            kind,
            code: Some(status.to_string()),
            message: body,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error from {}: {}", self.kind, self.provider, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[derive(Debug, Clone)]
pub enum AppError {
    Validation(String),
    NoProviderAvailable(String),
    Provider(ProviderError),
    ConcurrencyConflict(String),
    ConcurrentRequest(String),
    InvalidSignature(String),
    UnknownProvider(String),
    MissingEventId(String),
    NotFound(String),
    RateLimited(String),
    Database(String),
    Cache(String),
    Serialization(String),
    Configuration(String),
    Internal(String),
}

impl std::error::Error for AppError {}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::NoProviderAvailable(msg) => write!(f, "No provider available: {}", msg),
            AppError::Provider(err) => write!(f, "{}", err),
            AppError::ConcurrencyConflict(msg) => write!(f, "Concurrency conflict: {}", msg),
            AppError::ConcurrentRequest(msg) => write!(f, "Concurrent request: {}", msg),
            AppError::InvalidSignature(msg) => write!(f, "Invalid signature: {}", msg),
            AppError::UnknownProvider(msg) => write!(f, "Unknown provider: {}", msg),
            AppError::MissingEventId(msg) => write!(f, "Missing event id: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            AppError::Database(msg) => write!(f, "Database error: {}", msg),
            AppError::Cache(msg) => write!(f, "Cache error: {}", msg),
            AppError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable error code surfaced in HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NoProviderAvailable(_) => "NO_PROVIDER_AVAILABLE",
            AppError::Provider(_) => "PAYMENT_PROCESSING_ERROR",
            AppError::ConcurrencyConflict(_) => "CONCURRENCY_CONFLICT",
            AppError::ConcurrentRequest(_) => "CONCURRENT_REQUEST",
            AppError::InvalidSignature(_) => "INVALID_SIGNATURE",
            AppError::UnknownProvider(_) => "UNKNOWN_PROVIDER",
            AppError::MissingEventId(_) => "MISSING_EVENT_ID",
            AppError::NotFound(_) => "PAYMENT_NOT_FOUND",
            AppError::RateLimited(_) => "RATE_LIMITED",
            AppError::Database(_) => "INTERNAL_ERROR",
            AppError::Cache(_) => "INTERNAL_ERROR",
            AppError::Serialization(_) => "INTERNAL_ERROR",
            AppError::Configuration(_) => "INTERNAL_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<&AppError> for StatusCode {
    fn from(error: &AppError) -> Self {
        match error {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NoProviderAvailable(_) => StatusCode::BAD_REQUEST,
            AppError::Provider(_) => StatusCode::BAD_REQUEST,
            AppError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            AppError::ConcurrentRequest(_) => StatusCode::CONFLICT,
            AppError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            AppError::UnknownProvider(_) => StatusCode::BAD_REQUEST,
            AppError::MissingEventId(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        AppError::Provider(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::Validation(format!("Invalid UUID: {}", err))
    }
}

impl From<paygrid_types::PaygridError> for AppError {
    fn from(err: paygrid_types::PaygridError) -> Self {
        use paygrid_types::PaygridError;
        match err {
            PaygridError::Database { message } => AppError::Database(message),
            PaygridError::Cache { message } => AppError::Cache(message),
            PaygridError::Validation { message } => AppError::Validation(message),
            PaygridError::TransactionNotFound { id } => {
                AppError::NotFound(format!("Transaction {} not found", id))
            }
            other => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_retry_policy() {
        assert!(ProviderErrorKind::Network.is_retryable());
        assert!(ProviderErrorKind::Timeout.is_retryable());
        assert!(ProviderErrorKind::RateLimited.is_retryable());
        assert!(ProviderErrorKind::ProviderInternal.is_retryable());
        assert!(!ProviderErrorKind::Auth.is_retryable());
        assert!(!ProviderErrorKind::InvalidRequest.is_retryable());
    }

    #[test]
    fn http_statuses_classify_408_and_429_as_transient() {
        let timeout = ProviderError::from_http_status("stripe", 408, String::new());
        assert!(timeout.is_retryable());

        let limited = ProviderError::from_http_status("stripe", 429, String::new());
        assert!(limited.is_retryable());

        let bad_request = ProviderError::from_http_status("stripe", 422, String::new());
        assert!(!bad_request.is_retryable());

        let auth = ProviderError::from_http_status("stripe", 401, String::new());
        assert_eq!(auth.kind, ProviderErrorKind::Auth);
    }

    #[test]
    fn status_codes_follow_the_error_contract() {
        assert_eq!(StatusCode::from(&AppError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(StatusCode::from(&AppError::InvalidSignature("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(StatusCode::from(&AppError::ConcurrentRequest("x".into())), StatusCode::CONFLICT);
        assert_eq!(StatusCode::from(&AppError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(StatusCode::from(&AppError::RateLimited("x".into())), StatusCode::TOO_MANY_REQUESTS);
    }
}
