use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod errors;

pub use envelope::*;
pub use errors::*;

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;

/// Opaque identifier propagated across logs, events and provider calls for a
/// single caller-triggered workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.trim().is_empty() => Self(v.trim().to_string()),
            _ => Self::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_from_header_prefers_caller_value() {
        let id = CorrelationId::from_header(Some("req-123"));
        assert_eq!(id.as_str(), "req-123");
    }

    #[test]
    fn correlation_id_from_header_generates_when_missing() {
        let id = CorrelationId::from_header(None);
        assert!(!id.as_str().is_empty());

        let blank = CorrelationId::from_header(Some("  "));
        assert!(!blank.as_str().is_empty());
        assert_ne!(blank.as_str(), "  ");
    }
}
