use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CorrelationId;

/// Wire envelope for lifecycle events published to the message bus.
///
/// The bus is at-least-once; consumers deduplicate on `event_id` or on the
/// transaction id inside `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            correlation_id,
            occurred_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = EventEnvelope::new(
            "payment.completed",
            serde_json::json!({"transaction_id": "abc"}),
            CorrelationId::new(),
        );

        let raw = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.event_type, "payment.completed");
        assert_eq!(back.event_id, envelope.event_id);
    }
}
