use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use paygrid_types::CorrelationId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
}

impl EventMetadata {
    pub fn for_aggregate(
        event_type: &str,
        aggregate_id: Uuid,
        aggregate_type: &str,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_id,
            aggregate_type: aggregate_type.to_string(),
            occurred_at: Utc::now(),
            correlation_id,
        }
    }
}

/// A lifecycle fact about an aggregate, suitable for publication on the bus.
pub trait DomainEvent: std::fmt::Debug + Send + Sync {
    fn metadata(&self) -> &EventMetadata;

    fn event_type(&self) -> &str {
        &self.metadata().event_type
    }

    fn aggregate_id(&self) -> Uuid {
        self.metadata().aggregate_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata().occurred_at
    }

    fn event_data(&self) -> serde_json::Value;
}
